//! Child collections reconciled below a parent element (VPN sites).
//!
//! Each declared child is matched by name. Under the merge policy only the
//! members a child does not list yet are added; under overwrite the member
//! list is replaced unless it already holds exactly the declared members.

use serde_json::Value;

use crate::changelog::{Action, ChangeRecord};
use crate::document::{CollectionPolicy, ElementDescriptor};
use crate::registry::ChildSpec;
use crate::resolve::ReferenceCache;
use crate::store::{Attributes, ObjectStore, Reference, RemoteObject};

/// Declared members a child does not list yet, in declared order.
pub fn missing_members(current: &[String], declared: &[String]) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for member in declared {
        if !current.contains(member) && !missing.contains(member) {
            missing.push(member.clone());
        }
    }
    missing
}

fn member_hrefs(child: &RemoteObject, member_field: &str) -> Vec<String> {
    child
        .attributes
        .get(member_field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn member_attributes(member_field: &str, hrefs: Vec<String>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(
        member_field.to_string(),
        Value::Array(hrefs.into_iter().map(Value::String).collect()),
    );
    attributes
}

/// Reconciles the children an element declares below `parent`.
///
/// Returns one record per declared child, `unchanged` included.
pub async fn reconcile_children(
    store: &dyn ObjectStore,
    spec: &ChildSpec,
    parent: &Reference,
    element: &ElementDescriptor,
    cache: &ReferenceCache<'_>,
    dry_run: bool,
) -> Vec<ChangeRecord> {
    let Some(value) = element.attributes.get(spec.field) else {
        return Vec::new();
    };
    let scope = element.identity.to_string();

    let declared = match spec.parse(value) {
        Ok(declared) => declared,
        Err(message) => return vec![ChangeRecord::failed(&element.identity, message)],
    };

    // A parent that only exists in a dry run has no children yet.
    let existing = if parent.is_planned() {
        Vec::new()
    } else {
        match store.children(parent, spec.kind).await {
            Ok(existing) => existing,
            Err(e) => {
                return declared
                    .iter()
                    .map(|child| {
                        ChangeRecord::new(spec.kind, child.name.clone(), Action::Failed)
                            .with_reason(e.to_string())
                            .with_scope(scope.clone())
                    })
                    .collect()
            }
        }
    };

    let mut records = Vec::with_capacity(declared.len());

    for child in declared {
        let record = |action| ChangeRecord::new(spec.kind, child.name.clone(), action).with_scope(scope.clone());

        let mut hrefs = Vec::with_capacity(child.members.len());
        let mut unresolved = None;
        for member in &child.members {
            match cache.reference(member) {
                Some(reference) => hrefs.push(reference.href.clone()),
                None => {
                    unresolved = Some(member.clone());
                    break;
                }
            }
        }
        if let Some(member) = unresolved {
            records.push(
                record(Action::Failed).with_reason(format!("member {} is not resolved", member)),
            );
            continue;
        }

        let Some(current) = existing.iter().find(|c| c.reference.name == child.name) else {
            if !dry_run {
                let attributes = member_attributes(spec.member_field, hrefs);
                if let Err(e) = store
                    .create_child(parent, spec.kind, &child.name, &attributes)
                    .await
                {
                    records.push(record(Action::Failed).with_reason(e.to_string()));
                    continue;
                }
            }
            log::info!("Created {} {} below {}", spec.kind, child.name, scope);
            records.push(record(Action::Created));
            continue;
        };

        let present = member_hrefs(current, spec.member_field);
        let wanted = match element.policy {
            CollectionPolicy::Merge => {
                let missing = missing_members(&present, &hrefs);
                if missing.is_empty() {
                    None
                } else {
                    Some(present.iter().cloned().chain(missing).collect::<Vec<_>>())
                }
            }
            CollectionPolicy::Overwrite => {
                let unchanged = present.len() == hrefs.len()
                    && missing_members(&present, &hrefs).is_empty()
                    && missing_members(&hrefs, &present).is_empty();
                if unchanged {
                    None
                } else {
                    Some(hrefs)
                }
            }
        };

        let Some(wanted) = wanted else {
            records.push(record(Action::Unchanged));
            continue;
        };

        if !dry_run {
            let mut attributes = current.attributes.clone();
            attributes.extend(member_attributes(spec.member_field, wanted));
            if let Err(e) = store.update(current, &attributes).await {
                records.push(record(Action::Failed).with_reason(e.to_string()));
                continue;
            }
        }
        log::info!("Modified {} {} below {}", spec.kind, child.name, scope);
        records.push(record(Action::Modified).with_fields(vec![spec.member_field.to_string()]));
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Identity;
    use crate::registry::Registry;
    use crate::store::{MatchOptions, MemoryStore};
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_members_is_per_element() {
        let current = strings(&["n1", "n2"]);
        assert_eq!(
            missing_members(&current, &strings(&["n2", "n3", "n3"])),
            strings(&["n3"])
        );
        assert!(missing_members(&current, &strings(&["n1"])).is_empty());
    }

    struct Fixture {
        store: MemoryStore,
        gateway: Reference,
        n1: Reference,
        n2: Reference,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let gateway = store.seed("external_gateway", "gw1", Attributes::new());
        let n1 = store.seed("network", "n1", Attributes::new());
        let n2 = store.seed("network", "n2", Attributes::new());
        Fixture {
            store,
            gateway,
            n1,
            n2,
        }
    }

    fn gateway(policy_overwrite: bool, members: &[&str]) -> ElementDescriptor {
        let element = ElementDescriptor::new("external_gateway", "gw1").with_attribute(
            "vpn_site",
            json!([{"name": "site-a", "site_element": {"network": members}}]),
        );
        if policy_overwrite {
            element.overwrite()
        } else {
            element
        }
    }

    async fn run(fx: &Fixture, element: &ElementDescriptor) -> Vec<ChangeRecord> {
        let registry = Registry::builtin();
        let spec = registry
            .lookup("external_gateway")
            .and_then(|k| k.children)
            .unwrap();
        let mut cache = ReferenceCache::new(&fx.store, MatchOptions::default());
        cache
            .resolve_many(&[Identity::new("network", "n1"), Identity::new("network", "n2")])
            .await
            .unwrap();
        reconcile_children(&fx.store, spec, &fx.gateway, element, &cache, false).await
    }

    fn site_members(fx: &Fixture) -> Vec<Value> {
        fx.store.children_of(&fx.gateway, "vpn_site")[0].1["site_element"]
            .as_array()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_site_created_when_absent() {
        let fx = fixture();
        let records = run(&fx, &gateway(false, &["n1"])).await;
        assert_eq!(records[0].action, Action::Created);
        assert_eq!(records[0].scope.as_deref(), Some("external_gateway/gw1"));
        assert_eq!(site_members(&fx), vec![json!(fx.n1.href)]);
    }

    #[tokio::test]
    async fn test_partial_overlap_adds_only_missing_members() {
        let fx = fixture();
        fx.store.seed_child(
            &fx.gateway,
            "vpn_site",
            "site-a",
            member_attributes("site_element", vec![fx.n1.href.clone()]),
        );

        let records = run(&fx, &gateway(false, &["n1", "n2"])).await;
        assert_eq!(records[0].action, Action::Modified);
        assert_eq!(
            site_members(&fx),
            vec![json!(fx.n1.href), json!(fx.n2.href)]
        );
    }

    #[tokio::test]
    async fn test_fully_present_site_issues_no_update() {
        let fx = fixture();
        fx.store.seed_child(
            &fx.gateway,
            "vpn_site",
            "site-a",
            member_attributes("site_element", vec![fx.n2.href.clone(), fx.n1.href.clone()]),
        );
        fx.store.clear_journal();

        let records = run(&fx, &gateway(false, &["n1", "n2"])).await;
        assert_eq!(records[0].action, Action::Unchanged);
        assert!(fx.store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_member_set() {
        let fx = fixture();
        fx.store.seed_child(
            &fx.gateway,
            "vpn_site",
            "site-a",
            member_attributes("site_element", vec![fx.n1.href.clone(), fx.n2.href.clone()]),
        );

        let records = run(&fx, &gateway(true, &["n2"])).await;
        assert_eq!(records[0].action, Action::Modified);
        assert_eq!(site_members(&fx), vec![json!(fx.n2.href)]);
    }
}
