//! Policy VPN gateway membership.

use serde_json::json;

use super::orchestrator::EngineContext;
use super::spec::{EngineSpec, PolicyVpnSpec};
use super::Stage;
use crate::changelog::{Action, ChangeRecord};
use crate::document::{CollectionPolicy, Identity};
use crate::reconcile::AttributeDiff;
use crate::store::{Attributes, Reference};

const GATEWAY_KIND: &str = "gateway_node";

fn membership(vpn: &PolicyVpnSpec, gateway: &Reference) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("gateway".to_string(), json!(gateway.href));
    attributes.insert("role".to_string(), json!(vpn.role()));
    attributes.insert("mobile_gateway".to_string(), json!(vpn.mobile_gateway));
    attributes
}

/// Makes the engine a central or satellite gateway of each listed VPN.
///
/// Memberships are matched by engine name. Failures are recorded per VPN.
pub(crate) async fn reconcile_memberships(spec: &EngineSpec, ctx: &mut EngineContext<'_>) {
    for vpn in &spec.policy_vpn {
        let record = |action| {
            ChangeRecord::new("policy_vpn", vpn.name.clone(), action).with_scope(Stage::PolicyVpn.name())
        };

        let Some(vpn_ref) = ctx
            .cache
            .reference(&Identity::new("policy_vpn", vpn.name.clone()))
            .cloned()
        else {
            ctx.record(record(Action::Failed).with_reason("policy VPN is not resolved"));
            continue;
        };

        let wanted = membership(vpn, &ctx.engine);

        let gateways = match ctx.store.children(&vpn_ref, GATEWAY_KIND).await {
            Ok(gateways) => gateways,
            Err(e) => {
                ctx.record(record(Action::Failed).with_reason(e.to_string()));
                continue;
            }
        };

        let Some(current) = gateways.iter().find(|g| g.reference.name == spec.name) else {
            if !ctx.dry_run() {
                if let Err(e) = ctx
                    .store
                    .create_child(&vpn_ref, GATEWAY_KIND, &spec.name, &wanted)
                    .await
                {
                    log::warn!("Failed to add {} to VPN {}: {}", ctx.identity, vpn.name, e);
                    ctx.record(record(Action::Failed).with_reason(e.to_string()));
                    continue;
                }
            }
            log::info!("Added {} to VPN {} as {}", ctx.identity, vpn.name, vpn.role());
            ctx.record(record(Action::Modified).with_fields(vec![GATEWAY_KIND.to_string()]));
            continue;
        };

        let diff = AttributeDiff::compute(&current.attributes, &wanted, CollectionPolicy::Merge);
        if diff.is_empty() {
            ctx.record(record(Action::Unchanged));
            continue;
        }

        if !ctx.dry_run() {
            let updated = diff.apply_to(&current.attributes);
            if let Err(e) = ctx.store.update(current, &updated).await {
                log::warn!("Failed to update {} in VPN {}: {}", ctx.identity, vpn.name, e);
                ctx.record(record(Action::Failed).with_reason(e.to_string()));
                continue;
            }
        }
        log::info!("Changed {} in VPN {} ({})", ctx.identity, vpn.name, diff.fields().join(", "));
        ctx.record(record(Action::Modified).with_fields(diff.fields()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOrchestrator;
    use crate::pass::PassOptions;
    use crate::registry::Registry;
    use crate::store::MemoryStore;

    fn spec(central: bool) -> EngineSpec {
        EngineSpec {
            name: "fw1".to_string(),
            policy_vpn: vec![PolicyVpnSpec {
                name: "corp".to_string(),
                central_node: central,
                satellite_node: !central,
                mobile_gateway: false,
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
    async fn test_joins_vpn_then_changes_role() {
        let store = MemoryStore::new();
        let engine = store.seed("single_fw", "fw1", Attributes::new());
        let vpn = store.seed("policy_vpn", "corp", Attributes::new());

        let outcome = run(&store, &spec(false)).await;
        assert_eq!(outcome.state[0].action, Action::Modified);
        let members = store.children_of(&vpn, GATEWAY_KIND);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].1["gateway"], json!(engine.href));
        assert_eq!(members[0].1["role"], json!("satellite"));

        let again = run(&store, &spec(false)).await;
        assert!(!again.changed);

        let promoted = run(&store, &spec(true)).await;
        assert_eq!(promoted.state[0].fields, vec!["role".to_string()]);
        assert_eq!(store.children_of(&vpn, GATEWAY_KIND)[0].1["role"], json!("central"));
    }

    #[tokio::test]
    async fn test_missing_vpn_fails_validation() {
        let store = MemoryStore::new();
        store.seed("single_fw", "fw1", Attributes::new());
        let registry = Registry::builtin();
        let err = EngineOrchestrator::new(&store, &registry)
            .converge(&spec(true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("policy_vpn/corp"));
    }
}
