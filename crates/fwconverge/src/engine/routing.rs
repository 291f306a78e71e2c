//! Dynamic routing settings and routing attachments.
//!
//! BGP and OSPF settings live in the engine's `dynamic_routing` attribute
//! and are written with one update. Attachments (BGP peerings, OSPF areas,
//! netlinks, static routes) are nested objects named
//! `{interface}:{kind}:{element}`. They are added when missing and updated
//! when they differ; attachments the document does not mention stay.

use serde_json::{json, Map, Value};

use super::orchestrator::{list_policy, EngineContext};
use super::spec::{EngineSpec, InterfaceId};
use super::Stage;
use crate::changelog::{Action, ChangeRecord};
use crate::document::{CollectionPolicy, Identity};
use crate::error::Result;
use crate::reconcile::AttributeDiff;
use crate::store::Attributes;

const ATTACHMENT_KIND: &str = "routing_attachment";

fn merge_list(current: Option<&Value>, declared: Vec<Value>, policy: CollectionPolicy) -> Value {
    let existing = current.and_then(Value::as_array).cloned().unwrap_or_default();
    match policy {
        CollectionPolicy::Overwrite => Value::Array(declared),
        CollectionPolicy::Merge => {
            let mut merged = existing;
            for value in declared {
                if !merged.contains(&value) {
                    merged.push(value);
                }
            }
            Value::Array(merged)
        }
    }
}

fn optional_href(ctx: &EngineContext<'_>, type_tag: &str, name: &Option<String>) -> Value {
    name.as_ref()
        .and_then(|name| ctx.href(&Identity::new(type_tag, name.clone())))
        .map_or(Value::Null, Value::String)
}

/// The `dynamic_routing` value the engine should end up with.
fn dynamic_routing(spec: &EngineSpec, ctx: &EngineContext<'_>, current: Option<&Value>) -> Value {
    let mut routing: Map<String, Value> = current
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(bgp) = &spec.bgp {
        let announced = ctx.hrefs(bgp.announced_networks.iter().map(|n| n.identity()));
        let current_announced = routing
            .get("bgp")
            .and_then(|b| b.get("announced_networks"));
        let announced = merge_list(current_announced, announced, list_policy(spec));

        routing.insert(
            "bgp".to_string(),
            json!({
                "enabled": bgp.enabled,
                "router_id": bgp.router_id,
                "autonomous_system": optional_href(ctx, "autonomous_system", &bgp.autonomous_system),
                "bgp_profile": optional_href(ctx, "bgp_profile", &bgp.bgp_profile),
                "announced_networks": announced,
            }),
        );
    }

    if let Some(ospf) = &spec.ospf {
        routing.insert(
            "ospf".to_string(),
            json!({
                "enabled": ospf.enabled,
                "router_id": ospf.router_id,
                "ospf_profile": optional_href(ctx, "ospfv2_profile", &ospf.ospf_profile),
            }),
        );
    }

    Value::Object(routing)
}

pub(crate) async fn reconcile_dynamic_routing(spec: &EngineSpec, ctx: &mut EngineContext<'_>) -> Result<()> {
    let current = match ctx.current().await {
        Ok(current) => current,
        Err(e) => return Err(ctx.abort(Stage::DynamicRouting, e)),
    };

    let wanted = dynamic_routing(spec, ctx, current.attributes.get("dynamic_routing"));
    let mut patch = Attributes::new();
    patch.insert("dynamic_routing".to_string(), wanted);

    ctx.patch_current(Stage::DynamicRouting, current, patch, CollectionPolicy::Merge)
        .await
}

/// A routing attachment the engine should carry.
#[derive(Debug, Clone, PartialEq)]
struct Attachment {
    name: String,
    attributes: Attributes,
}

impl Attachment {
    fn new(interface_id: &str, kind: &str, element: &Identity, ctx: &EngineContext<'_>) -> Self {
        let interface_id = InterfaceId::normalize(interface_id);
        let mut attributes = Attributes::new();
        attributes.insert("interface_id".to_string(), json!(interface_id));
        attributes.insert("kind".to_string(), json!(kind));
        attributes.insert("element".to_string(), json!(ctx.href(element)));
        Self {
            name: format!("{}:{}:{}", interface_id, kind, element.name),
            attributes,
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

fn attachments(spec: &EngineSpec, ctx: &EngineContext<'_>) -> Vec<Attachment> {
    let mut wanted = Vec::new();

    if let Some(bgp) = &spec.bgp {
        for peering in &bgp.bgp_peering {
            let element = Identity::new("bgp_peering", peering.name.clone());
            wanted.push(
                Attachment::new(&peering.interface_id, "bgp_peering", &element, ctx)
                    .with("peer", json!(ctx.href(peering.peer.identity()))),
            );
        }
    }

    if let Some(ospf) = &spec.ospf {
        for area in &ospf.ospf_areas {
            let element = Identity::new("ospfv2_area", area.name.clone());
            let mut attachment = Attachment::new(&area.interface_id, "ospfv2_area", &element, ctx);
            if let Some(network) = &area.network {
                attachment = attachment.with("network", json!(network));
            }
            wanted.push(attachment);
        }
    }

    for netlink in &spec.netlinks {
        let element = Identity::new("static_netlink", netlink.name.clone());
        wanted.push(Attachment::new(&netlink.interface_id, "netlink", &element, ctx));
    }

    for route in &spec.static_routes {
        let destinations = ctx.hrefs(route.destinations.iter().map(|d| d.identity()));
        wanted.push(
            Attachment::new(&route.interface_id, "static_route", route.gateway.identity(), ctx)
                .with("destinations", Value::Array(destinations)),
        );
    }

    wanted
}

fn record(name: &str, action: Action) -> ChangeRecord {
    ChangeRecord::new(ATTACHMENT_KIND, name, action).with_scope(Stage::RoutingAttachments.name())
}

/// Adds missing routing attachments and updates differing ones.
///
/// Failures are recorded per attachment; the pass goes on.
pub(crate) async fn reconcile_attachments(spec: &EngineSpec, ctx: &mut EngineContext<'_>) {
    let wanted = attachments(spec, ctx);

    let existing = match ctx.engine_children(ATTACHMENT_KIND).await {
        Ok(existing) => existing,
        Err(e) => {
            log::error!("Cannot list routing attachments of {}: {}", ctx.identity, e);
            for attachment in &wanted {
                ctx.record(record(&attachment.name, Action::Failed).with_reason(e.to_string()));
            }
            return;
        }
    };

    for attachment in wanted {
        let Some(current) = existing.iter().find(|e| e.reference.name == attachment.name) else {
            if !ctx.dry_run() {
                if let Err(e) = ctx
                    .store
                    .create_child(&ctx.engine, ATTACHMENT_KIND, &attachment.name, &attachment.attributes)
                    .await
                {
                    log::warn!("Failed to attach {} to {}: {}", attachment.name, ctx.identity, e);
                    ctx.record(record(&attachment.name, Action::Failed).with_reason(e.to_string()));
                    continue;
                }
            }
            log::info!("Attached {} to {}", attachment.name, ctx.identity);
            ctx.record(record(&attachment.name, Action::Created));
            continue;
        };

        let diff = AttributeDiff::compute(&current.attributes, &attachment.attributes, CollectionPolicy::Merge);
        if diff.is_empty() {
            ctx.record(record(&attachment.name, Action::Unchanged));
            continue;
        }

        if !ctx.dry_run() {
            let updated = diff.apply_to(&current.attributes);
            if let Err(e) = ctx.store.update(current, &updated).await {
                log::warn!("Failed to update {} on {}: {}", attachment.name, ctx.identity, e);
                ctx.record(record(&attachment.name, Action::Failed).with_reason(e.to_string()));
                continue;
            }
        }
        ctx.record(record(&attachment.name, Action::Modified).with_fields(diff.fields()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec::{
        BgpPeeringSpec, BgpSpec, InterfaceSpec, NetlinkSpec, NodeAddress, OspfSpec, StaticRouteSpec,
        TypedRef,
    };
    use crate::engine::EngineOrchestrator;
    use crate::pass::PassOptions;
    use crate::registry::Registry;
    use crate::store::{MemoryStore, Reference};

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_merge_list_keeps_existing_entries() {
        let current = json!(["a", "b"]);
        assert_eq!(
            merge_list(Some(&current), vec![json!("b"), json!("c")], CollectionPolicy::Merge),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            merge_list(Some(&current), vec![json!("c")], CollectionPolicy::Overwrite),
            json!(["c"])
        );
        assert_eq!(
            merge_list(None, vec![json!("c")], CollectionPolicy::Merge),
            json!(["c"])
        );
    }

    struct Fixture {
        store: MemoryStore,
        engine: Reference,
        lan: Reference,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let engine = store.seed("single_fw", "fw1", Attributes::new());
        store.seed_child(
            &engine,
            "interface",
            "0",
            attrs(json!({"interface_id": "0", "type": "physical"})),
        );
        store.seed("autonomous_system", "as-65001", Attributes::new());
        store.seed("bgp_peering", "uplink", Attributes::new());
        store.seed("external_bgp_peer", "isp", Attributes::new());
        store.seed("static_netlink", "wan", Attributes::new());
        store.seed("router", "gw", Attributes::new());
        let lan = store.seed("network", "lan", Attributes::new());
        Fixture { store, engine, lan }
    }

    fn spec() -> EngineSpec {
        EngineSpec {
            name: "fw1".to_string(),
            bgp: Some(BgpSpec {
                enabled: true,
                autonomous_system: Some("as-65001".to_string()),
                announced_networks: vec![TypedRef::new("network", "lan")],
                bgp_peering: vec![BgpPeeringSpec {
                    name: "uplink".to_string(),
                    interface_id: "0".to_string(),
                    peer: TypedRef::new("external_bgp_peer", "isp"),
                }],
                ..BgpSpec::default()
            }),
            netlinks: vec![NetlinkSpec {
                name: "wan".to_string(),
                interface_id: "0".to_string(),
            }],
            static_routes: vec![StaticRouteSpec {
                interface_id: "0".to_string(),
                gateway: TypedRef::new("router", "gw"),
                destinations: vec![TypedRef::new("network", "lan")],
            }],
            ..EngineSpec::default()
        }
    }

    async fn run(store: &MemoryStore, spec: &EngineSpec) -> crate::changelog::Outcome {
        let registry = Registry::builtin();
        EngineOrchestrator::new(store, &registry)
            .with_options(PassOptions::default())
            .converge(spec)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bgp_settings_and_attachments() {
        let fx = fixture();
        let outcome = run(&fx.store, &spec()).await;

        let engine = fx.store.attributes_of("single_fw", "fw1").unwrap();
        let bgp = &engine["dynamic_routing"]["bgp"];
        assert_eq!(bgp["enabled"], json!(true));
        assert_eq!(bgp["announced_networks"], json!([fx.lan.href]));

        let mut names: Vec<String> = fx
            .store
            .children_of(&fx.engine, ATTACHMENT_KIND)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["0:bgp_peering:uplink", "0:netlink:wan", "0:static_route:gw"]
        );
        assert_eq!(
            outcome
                .state
                .iter()
                .filter(|r| r.scope.as_deref() == Some("routing_attachments"))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_attachments_are_additive() {
        let fx = fixture();
        fx.store.seed_child(
            &fx.engine,
            ATTACHMENT_KIND,
            "0:netlink:legacy",
            attrs(json!({"interface_id": "0", "kind": "netlink"})),
        );

        run(&fx.store, &spec()).await;
        fx.store.clear_journal();
        let second = run(&fx.store, &spec()).await;

        assert!(!second.changed);
        assert!(fx.store.mutations().is_empty());
        assert_eq!(fx.store.children_of(&fx.engine, ATTACHMENT_KIND).len(), 4);
    }

    #[tokio::test]
    async fn test_ospf_keeps_existing_bgp_settings() {
        let fx = fixture();
        run(&fx.store, &spec()).await;

        let ospf_only = EngineSpec {
            name: "fw1".to_string(),
            ospf: Some(OspfSpec {
                enabled: true,
                router_id: Some("10.0.0.1".to_string()),
                ..OspfSpec::default()
            }),
            ..EngineSpec::default()
        };
        run(&fx.store, &ospf_only).await;

        let engine = fx.store.attributes_of("single_fw", "fw1").unwrap();
        assert_eq!(engine["dynamic_routing"]["bgp"]["enabled"], json!(true));
        assert_eq!(engine["dynamic_routing"]["ospf"]["router_id"], json!("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_announced_networks_merge_unless_overwrite() {
        let store = MemoryStore::new();
        store.seed("autonomous_system", "as-65001", Attributes::new());
        let lan = store.seed("network", "lan", Attributes::new());
        let dmz = store.seed("network", "dmz", Attributes::new());
        store.seed(
            "single_fw",
            "fw1",
            attrs(json!({"dynamic_routing": {"bgp": {"announced_networks": [dmz.href]}}})),
        );

        let mut spec = EngineSpec {
            name: "fw1".to_string(),
            bgp: Some(BgpSpec {
                enabled: true,
                autonomous_system: Some("as-65001".to_string()),
                announced_networks: vec![TypedRef::new("network", "lan")],
                ..BgpSpec::default()
            }),
            ..EngineSpec::default()
        };
        let announced = |store: &MemoryStore| {
            store.attributes_of("single_fw", "fw1").unwrap()["dynamic_routing"]["bgp"]
                ["announced_networks"]
                .clone()
        };

        run(&store, &spec).await;
        assert_eq!(announced(&store), json!([dmz.href, lan.href]));

        spec.overwrite_existing = true;
        run(&store, &spec).await;
        assert_eq!(announced(&store), json!([lan.href]));
    }

    #[tokio::test]
    async fn test_attachment_failure_does_not_abort() {
        let fx = fixture();
        fx.store.fail_mutations_of(ATTACHMENT_KIND, "0:netlink:wan");

        let mut spec = spec();
        spec.interfaces = vec![InterfaceSpec {
            interface_id: "0".to_string(),
            nodes: vec![NodeAddress {
                address: "10.0.0.1".to_string(),
                network_value: "10.0.0.0/24".to_string(),
                nodeid: 1,
            }],
            ..InterfaceSpec::default()
        }];
        let outcome = run(&fx.store, &spec).await;

        let failed: Vec<&str> = outcome.failures().map(|r| r.name.as_str()).collect();
        assert_eq!(failed, vec!["0:netlink:wan"]);
        assert_eq!(fx.store.children_of(&fx.engine, ATTACHMENT_KIND).len(), 2);
    }
}
