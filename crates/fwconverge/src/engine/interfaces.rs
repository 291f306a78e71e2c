//! Interfaces, VLANs and management roles.
//!
//! Parents are written before their VLANs. Interfaces the document does not
//! declare are only deleted with `delete_undefined_interfaces`, VLANs ahead
//! of the interface carrying them. Management roles are assigned once every
//! declared interface exists.

use serde_json::{json, Value};

use super::orchestrator::EngineContext;
use super::spec::{DeclaredInterface, EngineSpec, InterfaceId, InterfaceKind};
use super::Stage;
use crate::changelog::{Action, ChangeRecord};
use crate::document::{CollectionPolicy, Identity};
use crate::error::Result;
use crate::reconcile::AttributeDiff;
use crate::store::{Attributes, RemoteObject};

const KIND: &str = "interface";

/// Attributes an interface should carry on the server.
fn interface_attributes(interface: &DeclaredInterface, ctx: &EngineContext<'_>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("interface_id".to_string(), json!(interface.id));
    attributes.insert("type".to_string(), json!(interface.kind.as_str()));

    if let Some(zone) = &interface.zone_ref {
        let href = ctx.href(&Identity::new("interface_zone", zone.clone()));
        attributes.insert("zone_ref".to_string(), json!(href));
    }
    if let Some(comment) = &interface.comment {
        attributes.insert("comment".to_string(), json!(comment));
    }
    if !interface.nodes.is_empty() {
        let addresses: Vec<Value> = interface
            .nodes
            .iter()
            .map(|node| {
                json!({
                    "address": node.address,
                    "network_value": node.network_value,
                    "nodeid": node.nodeid,
                })
            })
            .collect();
        attributes.insert("addresses".to_string(), Value::Array(addresses));
    }
    if let Some(address) = &interface.cluster_virtual {
        attributes.insert("cluster_virtual".to_string(), json!(address));
    }
    if let Some(network) = &interface.network_value {
        attributes.insert("network_value".to_string(), json!(network));
    }
    if let Some(mac) = &interface.macaddress {
        attributes.insert("macaddress".to_string(), json!(mac));
    }
    attributes
}

fn sort_key(id: &str) -> (u32, bool, u32) {
    match id.parse::<InterfaceId>() {
        Ok(parsed) => (parsed.base, parsed.is_vlan(), parsed.vlan.unwrap_or_default()),
        Err(_) => (u32::MAX, false, 0),
    }
}

fn live_id(live: &RemoteObject) -> String {
    InterfaceId::normalize(&live.reference.name)
}

fn is_declared(live: &RemoteObject, declared: &[DeclaredInterface]) -> bool {
    let id = live_id(live);
    declared.iter().any(|d| d.id == id)
}

fn is_vlan(id: &str) -> bool {
    id.parse::<InterfaceId>().map(|i| i.is_vlan()).unwrap_or(false)
}

fn record(id: &str, action: Action) -> ChangeRecord {
    ChangeRecord::new(KIND, id, action).with_scope(Stage::Interfaces.name())
}

pub(crate) async fn reconcile(spec: &EngineSpec, ctx: &mut EngineContext<'_>) -> Result<()> {
    let mut declared = spec.declared_interfaces();
    declared.sort_by_key(|i| sort_key(&i.id));

    for interface in &declared {
        write_interface(interface, ctx).await?;
    }

    if spec.delete_undefined_interfaces {
        delete_undeclared(&declared, ctx).await?;
    } else {
        let undeclared = ctx
            .live_interfaces
            .iter()
            .filter(|live| !is_declared(live, &declared))
            .count();
        if undeclared > 0 {
            log::debug!(
                "Leaving {} undeclared interface(s) on {} in place",
                undeclared,
                ctx.identity
            );
        }
    }

    assign_roles(spec, &declared, ctx).await
}

async fn write_interface(interface: &DeclaredInterface, ctx: &mut EngineContext<'_>) -> Result<()> {
    let wanted = interface_attributes(interface, ctx);
    let live = ctx
        .live_interfaces
        .iter()
        .find(|i| live_id(i) == interface.id)
        .cloned();

    let Some(current) = live else {
        if !ctx.dry_run() {
            if let Err(e) = ctx
                .store
                .create_child(&ctx.engine, KIND, &interface.id, &wanted)
                .await
            {
                ctx.record(record(&interface.id, Action::Failed).with_reason(e.to_string()));
                return Err(ctx.abort(
                    Stage::Interfaces,
                    format!("creating interface {}: {}", interface.id, e),
                ));
            }
        }
        log::info!("Created interface {} on {}", interface.id, ctx.identity);
        ctx.record(record(&interface.id, Action::Created));
        return Ok(());
    };

    let diff = AttributeDiff::compute(&current.attributes, &wanted, CollectionPolicy::Overwrite);
    if diff.is_empty() {
        ctx.record(record(&interface.id, Action::Unchanged));
        return Ok(());
    }

    if !ctx.dry_run() {
        let updated = diff.apply_to(&current.attributes);
        if let Err(e) = ctx.store.update(&current, &updated).await {
            ctx.record(record(&interface.id, Action::Failed).with_reason(e.to_string()));
            return Err(ctx.abort(
                Stage::Interfaces,
                format!("updating interface {}: {}", interface.id, e),
            ));
        }
    }
    log::info!(
        "Modified interface {} on {} ({})",
        interface.id,
        ctx.identity,
        diff.fields().join(", ")
    );
    ctx.record(record(&interface.id, Action::Modified).with_fields(diff.fields()));
    Ok(())
}

async fn delete_undeclared(declared: &[DeclaredInterface], ctx: &mut EngineContext<'_>) -> Result<()> {
    let mut doomed: Vec<RemoteObject> = ctx
        .live_interfaces
        .iter()
        .filter(|live| !is_declared(live, declared))
        .cloned()
        .collect();
    // VLANs first, then the interfaces carrying them.
    doomed.sort_by_key(|i| (!is_vlan(&i.reference.name), sort_key(&i.reference.name)));

    for interface in doomed {
        let id = interface.reference.name.clone();
        if !ctx.dry_run() {
            if let Err(e) = ctx.store.delete(&interface.reference).await {
                ctx.record(record(&id, Action::Failed).with_reason(e.to_string()));
                return Err(ctx.abort(Stage::Interfaces, format!("deleting interface {}: {}", id, e)));
            }
        }
        log::info!("Deleted interface {} from {}", id, ctx.identity);
        ctx.record(record(&id, Action::Deleted));
    }
    Ok(())
}

/// Returns why an interface cannot take a management role, if it cannot.
///
/// `live` holds the interfaces that survive this pass.
fn role_blocker(id: &str, declared: &[DeclaredInterface], live: &[RemoteObject]) -> Option<&'static str> {
    if let Some(interface) = declared.iter().find(|d| d.id == id) {
        if interface.kind == InterfaceKind::Tunnel {
            return Some("tunnel interfaces cannot carry management roles");
        }
        if !interface.has_address() {
            return Some("the interface has no address");
        }
        return None;
    }

    let Some(live) = live.iter().find(|l| live_id(l) == id) else {
        return Some("the interface does not exist on the engine");
    };
    if live.attributes.get("type").and_then(Value::as_str) == Some(InterfaceKind::Tunnel.as_str()) {
        return Some("tunnel interfaces cannot carry management roles");
    }
    None
}

async fn assign_roles(
    spec: &EngineSpec,
    declared: &[DeclaredInterface],
    ctx: &mut EngineContext<'_>,
) -> Result<()> {
    let mut patch = Attributes::new();
    let surviving: Vec<RemoteObject> = if spec.delete_undefined_interfaces {
        Vec::new()
    } else {
        ctx.live_interfaces.clone()
    };

    for (role, id) in [
        ("primary_mgt", &spec.primary_mgt),
        ("backup_mgt", &spec.backup_mgt),
        ("primary_heartbeat", &spec.primary_heartbeat),
    ] {
        let Some(id) = id.as_deref().map(InterfaceId::normalize) else {
            continue;
        };
        match role_blocker(&id, declared, &surviving) {
            Some(reason) => {
                log::warn!("Skipping {} on interface {} of {}: {}", role, id, ctx.identity, reason);
            }
            None => {
                patch.insert(role.to_string(), json!(id));
            }
        }
    }

    if patch.is_empty() {
        return Ok(());
    }
    ctx.patch(Stage::Interfaces, patch, CollectionPolicy::Merge).await
}
