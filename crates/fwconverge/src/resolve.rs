//! Per-pass reference cache.
//!
//! Every `(type, name)` pair is looked up on the server at most once per
//! pass. Unresolvable references are collected in a missing set instead of
//! failing the lookup; the pass inspects that set before it mutates
//! anything. A cache belongs to exactly one pass and is dropped with it.

use std::collections::{BTreeSet, HashMap};

use crate::document::Identity;
use crate::store::{MatchOptions, ObjectStore, Reference, Result};

/// State of one identity within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exists on the server (or, in a dry run, would have been created).
    Resolved(Reference),
    /// Scheduled for creation by this pass.
    Pending,
    /// Neither on the server nor scheduled.
    Missing,
    /// The lookup matched more than one object.
    Ambiguous(usize),
}

impl Resolution {
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            Resolution::Resolved(reference) => Some(reference),
            _ => None,
        }
    }
}

pub struct ReferenceCache<'s> {
    store: &'s dyn ObjectStore,
    options: MatchOptions,
    entries: HashMap<Identity, Resolution>,
    missing: BTreeSet<Identity>,
    lookups: usize,
}

impl<'s> ReferenceCache<'s> {
    pub fn new(store: &'s dyn ObjectStore, options: MatchOptions) -> Self {
        Self {
            store,
            options,
            entries: HashMap::new(),
            missing: BTreeSet::new(),
            lookups: 0,
        }
    }

    /// Resolves a reference. A `Missing` result joins the missing set.
    ///
    /// Only transport-level failures are returned as errors.
    pub async fn resolve(&mut self, identity: &Identity) -> Result<Resolution> {
        let resolution = self.lookup(identity).await?;
        if resolution == Resolution::Missing {
            self.missing.insert(identity.clone());
        }
        Ok(resolution)
    }

    /// Resolves several references, one remote lookup per distinct
    /// uncached identity.
    pub async fn resolve_many<'i, I>(&mut self, identities: I) -> Result<()>
    where
        I: IntoIterator<Item = &'i Identity>,
    {
        for identity in identities {
            self.resolve(identity).await?;
        }
        Ok(())
    }

    /// Checks whether an element exists without treating absence as an
    /// unresolved reference. Used for an element's own identity.
    pub async fn probe(&mut self, identity: &Identity) -> Result<Resolution> {
        self.lookup(identity).await
    }

    async fn lookup(&mut self, identity: &Identity) -> Result<Resolution> {
        if let Some(cached) = self.entries.get(identity) {
            return Ok(cached.clone());
        }

        self.lookups += 1;
        let candidates = self
            .store
            .find(&identity.type_tag, &identity.name, self.options)
            .await;

        let resolution = match candidates {
            Ok(mut candidates) => match candidates.len() {
                0 => Resolution::Missing,
                1 => Resolution::Resolved(candidates.remove(0)),
                n => Resolution::Ambiguous(n),
            },
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                log::debug!("Lookup of {} failed: {}", identity, e);
                Resolution::Missing
            }
        };

        log::trace!("Resolved {} -> {:?}", identity, resolution);
        self.entries.insert(identity.clone(), resolution.clone());
        Ok(resolution)
    }

    /// Cached state of an identity, without any remote call.
    pub fn cached(&self, identity: &Identity) -> Option<&Resolution> {
        self.entries.get(identity)
    }

    /// Cached reference of an identity, if resolved.
    pub fn reference(&self, identity: &Identity) -> Option<&Reference> {
        self.entries.get(identity).and_then(Resolution::reference)
    }

    /// Marks an identity as being created by this pass.
    pub fn mark_pending(&mut self, identity: &Identity) {
        self.entries.insert(identity.clone(), Resolution::Pending);
    }

    /// Records the reference of an element this pass created.
    pub fn materialize(&mut self, identity: &Identity, reference: Reference) {
        self.missing.remove(identity);
        self.entries
            .insert(identity.clone(), Resolution::Resolved(reference));
    }

    /// Records that an element could not be created or no longer exists.
    pub fn mark_failed(&mut self, identity: &Identity) {
        self.entries.insert(identity.clone(), Resolution::Missing);
    }

    /// Adds an identity to the missing set.
    pub fn note_missing(&mut self, identity: &Identity) {
        self.missing.insert(identity.clone());
    }

    /// References that could not be resolved so far.
    pub fn missing(&self) -> &BTreeSet<Identity> {
        &self.missing
    }

    /// Returns true when no reference is missing.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }

    /// Number of remote lookups issued.
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn store(&self) -> &'s dyn ObjectStore {
        self.store
    }

    pub fn options(&self) -> MatchOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Attributes, MemoryStore};

    #[tokio::test]
    async fn test_resolve_memoizes_lookups() {
        let store = MemoryStore::new();
        store.seed("host", "web01", Attributes::new());
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());
        let web01 = Identity::new("host", "web01");

        for _ in 0..3 {
            assert!(matches!(
                cache.resolve(&web01).await.unwrap(),
                Resolution::Resolved(_)
            ));
        }
        assert_eq!(store.find_count(), 1);
        assert_eq!(cache.lookups(), 1);
    }

    #[tokio::test]
    async fn test_missing_is_recorded_not_raised() {
        let store = MemoryStore::new();
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());
        let ghost = Identity::new("host", "ghost");

        assert_eq!(cache.resolve(&ghost).await.unwrap(), Resolution::Missing);
        assert!(!cache.is_clean());
        assert!(cache.missing().contains(&ghost));

        // never silently retried
        cache.resolve(&ghost).await.unwrap();
        assert_eq!(store.find_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_many_deduplicates() {
        let store = MemoryStore::new();
        store.seed("network", "dmz", Attributes::new());
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());
        let dmz = Identity::new("network", "dmz");
        let lan = Identity::new("network", "lan");

        cache.resolve_many([&dmz, &lan, &dmz, &lan]).await.unwrap();
        assert_eq!(store.find_count(), 2);
        assert_eq!(cache.missing().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_does_not_count_as_missing() {
        let store = MemoryStore::new();
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());
        let new_host = Identity::new("host", "new");

        assert_eq!(cache.probe(&new_host).await.unwrap(), Resolution::Missing);
        assert!(cache.is_clean());

        cache.mark_pending(&new_host);
        assert_eq!(cache.resolve(&new_host).await.unwrap(), Resolution::Pending);
        assert!(cache.is_clean());
    }

    #[tokio::test]
    async fn test_ambiguous_relaxed_match() {
        let store = MemoryStore::new();
        store.seed("router", "branch-1", Attributes::new());
        store.seed("router", "branch-2", Attributes::new());
        let options = MatchOptions {
            exact: false,
            case_sensitive: true,
        };
        let mut cache = ReferenceCache::new(&store, options);

        let resolution = cache
            .resolve(&Identity::new("router", "branch"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Ambiguous(2));
    }

    #[tokio::test]
    async fn test_materialize_clears_missing() {
        let store = MemoryStore::new();
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());
        let asn = Identity::new("autonomous_system", "as-200");

        cache.resolve(&asn).await.unwrap();
        cache.materialize(&asn, Reference::planned("autonomous_system", "as-200"));
        assert!(cache.is_clean());
        assert!(cache.reference(&asn).is_some_and(Reference::is_planned));
    }

    #[tokio::test]
    async fn test_transport_errors_propagate() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let mut cache = ReferenceCache::new(&store, MatchOptions::default());

        let err = cache
            .resolve(&Identity::new("host", "web01"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(cache.is_clean());
    }
}
