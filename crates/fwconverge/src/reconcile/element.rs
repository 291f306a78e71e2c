//! Update-or-create for a single element.

use crate::changelog::{Action, ChangeRecord};
use crate::document::{ElementDescriptor, Identity};
use crate::registry::Registry;
use crate::resolve::{ReferenceCache, Resolution};
use crate::store::{ObjectStore, Reference};

use super::diff::AttributeDiff;

/// Converges one element at a time against the store.
pub struct ElementReconciler<'a> {
    store: &'a dyn ObjectStore,
    registry: &'a Registry,
    dry_run: bool,
}

impl<'a> ElementReconciler<'a> {
    pub fn new(store: &'a dyn ObjectStore, registry: &'a Registry) -> Self {
        Self {
            store,
            registry,
            dry_run: false,
        }
    }

    /// Computes everything but skips mutating calls.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Brings one element in line with its descriptor.
    ///
    /// Remote failures never escape: they come back as a `failed` record.
    /// No-ops come back as `unchanged`.
    pub async fn apply(
        &self,
        element: &ElementDescriptor,
        cache: &mut ReferenceCache<'_>,
    ) -> ChangeRecord {
        let identity = &element.identity;

        let Some(kind) = self.registry.lookup(identity.type_tag.as_str()) else {
            return ChangeRecord::failed(identity, "unknown element type");
        };

        let resolution = match cache.cached(identity).cloned() {
            Some(resolution) => resolution,
            None => match cache.probe(identity).await {
                Ok(resolution) => resolution,
                Err(e) => return ChangeRecord::failed(identity, e.to_string()),
            },
        };

        let existing: Option<Reference> = match resolution {
            Resolution::Resolved(reference) => Some(reference),
            Resolution::Pending | Resolution::Missing => None,
            Resolution::Ambiguous(n) => {
                return ChangeRecord::failed(identity, format!("{} elements match this name", n))
            }
        };

        if element.is_absent() {
            let Some(reference) = existing else {
                return ChangeRecord::for_identity(identity, Action::Unchanged);
            };
            if !self.dry_run {
                if let Err(e) = self.store.delete(&reference).await {
                    log::warn!("Failed to delete {}: {}", identity, e);
                    return ChangeRecord::failed(identity, e.to_string());
                }
            }
            cache.mark_failed(identity);
            log::info!("Deleted {}", identity);
            return ChangeRecord::for_identity(identity, Action::Deleted);
        }

        let rendered = {
            let href_of = |id: &Identity| cache.reference(id).map(|r| r.href.clone());
            match kind.render(&element.attributes, &href_of) {
                Ok(rendered) => rendered,
                Err(unresolved) => {
                    return ChangeRecord::failed(
                        identity,
                        format!("reference {} is not resolved", unresolved),
                    )
                }
            }
        };

        match existing {
            Some(reference) => {
                let current = match self.store.get(&reference).await {
                    Ok(current) => current,
                    Err(e) => return ChangeRecord::failed(identity, e.to_string()),
                };

                let diff = AttributeDiff::compute(&current.attributes, &rendered, element.policy);
                if diff.is_empty() {
                    log::debug!("{} is up to date", identity);
                    return ChangeRecord::for_identity(identity, Action::Unchanged);
                }

                if !self.dry_run {
                    let updated = diff.apply_to(&current.attributes);
                    if let Err(e) = self.store.update(&current, &updated).await {
                        log::warn!("Failed to update {}: {}", identity, e);
                        return ChangeRecord::failed(identity, e.to_string());
                    }
                }

                log::info!("Modified {} ({})", identity, diff.fields().join(", "));
                ChangeRecord::for_identity(identity, Action::Modified).with_fields(diff.fields())
            }
            None => {
                let created = if self.dry_run {
                    Ok(Reference::planned(&identity.type_tag, &identity.name))
                } else {
                    self.store
                        .create(&identity.type_tag, &identity.name, &rendered)
                        .await
                };

                match created {
                    Ok(reference) => {
                        log::info!("Created {}", identity);
                        cache.materialize(identity, reference);
                        ChangeRecord::for_identity(identity, Action::Created)
                    }
                    Err(e) => {
                        log::warn!("Failed to create {}: {}", identity, e);
                        cache.mark_failed(identity);
                        ChangeRecord::failed(identity, e.to_string())
                    }
                }
            }
        }
    }
}
