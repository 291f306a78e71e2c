//! In-process object store.
//!
//! Keeps objects in a map, journals every call and can be told to fail
//! mutations of specific elements. Used by the test suites and for planning
//! against a snapshot without a management server.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Attributes, MatchOptions, ObjectStore, Reference, RemoteObject, Result, StoreError};

/// A call received by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Find { type_tag: String, name: String },
    Get { href: String },
    Create { type_tag: String, name: String },
    Update { href: String },
    Delete { href: String },
    Children { parent: String, kind: String },
    CreateChild { parent: String, kind: String, name: String },
}

impl StoreCall {
    /// Returns true for calls that change remote state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StoreCall::Create { .. }
                | StoreCall::Update { .. }
                | StoreCall::Delete { .. }
                | StoreCall::CreateChild { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    reference: Reference,
    attributes: Attributes,
    /// Href of the parent for nested objects.
    parent: Option<String>,
    /// Child kind for nested objects.
    kind: Option<String>,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    journal: Vec<StoreCall>,
    failing: HashSet<(String, String)>,
    offline: bool,
}

impl Inner {
    fn allocate_href(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}/{}", prefix, self.next_id)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(StoreError::Transport(
                "connection refused (store offline)".to_string(),
            ));
        }
        Ok(())
    }

    fn check_failure(&self, type_tag: &str, name: &str) -> Result<()> {
        if self
            .failing
            .contains(&(type_tag.to_string(), name.to_string()))
        {
            return Err(StoreError::Api {
                status: 400,
                message: format!("injected failure for {}/{}", type_tag, name),
            });
        }
        Ok(())
    }

    fn insert(
        &mut self,
        reference: Reference,
        attributes: Attributes,
        parent: Option<String>,
        kind: Option<String>,
    ) {
        self.objects.insert(
            reference.href.clone(),
            StoredObject {
                reference,
                attributes,
                parent,
                kind,
                version: 1,
            },
        );
    }
}

/// In-memory [`ObjectStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-call;
        // the map itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a top-level object without journaling the call.
    pub fn seed(&self, type_tag: &str, name: &str, attributes: Attributes) -> Reference {
        let mut inner = self.lock();
        let href = inner.allocate_href(&format!("mem://{}", type_tag));
        let reference = Reference::new(type_tag, name, href);
        inner.insert(reference.clone(), attributes, None, None);
        reference
    }

    /// Adds a nested object without journaling the call.
    pub fn seed_child(
        &self,
        parent: &Reference,
        kind: &str,
        name: &str,
        attributes: Attributes,
    ) -> Reference {
        let mut inner = self.lock();
        let href = inner.allocate_href(&format!("{}/{}", parent.href, kind));
        let reference = Reference::new(kind, name, href);
        inner.insert(
            reference.clone(),
            attributes,
            Some(parent.href.clone()),
            Some(kind.to_string()),
        );
        reference
    }

    /// Makes every mutation of the given element fail with an API error.
    pub fn fail_mutations_of(&self, type_tag: &str, name: &str) {
        self.lock()
            .failing
            .insert((type_tag.to_string(), name.to_string()));
    }

    /// Simulates an unreachable server.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Returns every call received so far.
    pub fn journal(&self) -> Vec<StoreCall> {
        self.lock().journal.clone()
    }

    /// Returns the mutating calls received so far.
    pub fn mutations(&self) -> Vec<StoreCall> {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Returns the number of lookups received so far.
    pub fn find_count(&self) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|c| matches!(c, StoreCall::Find { .. }))
            .count()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Returns the reference of a top-level object, if present.
    pub fn reference_of(&self, type_tag: &str, name: &str) -> Option<Reference> {
        self.lock()
            .objects
            .values()
            .find(|o| {
                o.parent.is_none() && o.reference.type_tag == type_tag && o.reference.name == name
            })
            .map(|o| o.reference.clone())
    }

    /// Returns the attributes of a top-level object, if present.
    pub fn attributes_of(&self, type_tag: &str, name: &str) -> Option<Attributes> {
        self.lock()
            .objects
            .values()
            .find(|o| {
                o.parent.is_none() && o.reference.type_tag == type_tag && o.reference.name == name
            })
            .map(|o| o.attributes.clone())
    }

    /// Returns `(name, attributes)` of the nested objects of `kind` below `parent`.
    pub fn children_of(&self, parent: &Reference, kind: &str) -> Vec<(String, Attributes)> {
        self.lock()
            .objects
            .values()
            .filter(|o| {
                o.parent.as_deref() == Some(parent.href.as_str()) && o.kind.as_deref() == Some(kind)
            })
            .map(|o| (o.reference.name.clone(), o.attributes.clone()))
            .collect()
    }

    /// Returns the number of times an object has been written.
    pub fn version_of(&self, reference: &Reference) -> Option<u64> {
        self.lock().objects.get(&reference.href).map(|o| o.version)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn find(
        &self,
        type_tag: &str,
        name: &str,
        options: MatchOptions,
    ) -> Result<Vec<Reference>> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Find {
            type_tag: type_tag.to_string(),
            name: name.to_string(),
        });
        inner.check_online()?;

        Ok(inner
            .objects
            .values()
            .filter(|o| {
                o.parent.is_none()
                    && o.reference.type_tag == type_tag
                    && options.matches(&o.reference.name, name)
            })
            .map(|o| o.reference.clone())
            .collect())
    }

    async fn get(&self, reference: &Reference) -> Result<RemoteObject> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Get {
            href: reference.href.clone(),
        });
        inner.check_online()?;

        let stored = inner
            .objects
            .get(&reference.href)
            .ok_or_else(|| StoreError::NotFound(reference.href.clone()))?;

        Ok(RemoteObject {
            reference: stored.reference.clone(),
            attributes: stored.attributes.clone(),
            etag: Some(format!("\"{}\"", stored.version)),
        })
    }

    async fn create(
        &self,
        type_tag: &str,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Reference> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Create {
            type_tag: type_tag.to_string(),
            name: name.to_string(),
        });
        inner.check_online()?;
        inner.check_failure(type_tag, name)?;

        let exists = inner.objects.values().any(|o| {
            o.parent.is_none() && o.reference.type_tag == type_tag && o.reference.name == name
        });
        if exists {
            return Err(StoreError::Api {
                status: 409,
                message: format!("{} '{}' already exists", type_tag, name),
            });
        }

        let href = inner.allocate_href(&format!("mem://{}", type_tag));
        let reference = Reference::new(type_tag, name, href);
        inner.insert(reference.clone(), attributes.clone(), None, None);
        Ok(reference)
    }

    async fn update(&self, current: &RemoteObject, attributes: &Attributes) -> Result<()> {
        let mut inner = self.lock();
        let href = current.reference.href.clone();
        inner.journal.push(StoreCall::Update { href: href.clone() });
        inner.check_online()?;
        inner.check_failure(&current.reference.type_tag, &current.reference.name)?;

        let stored = inner
            .objects
            .get_mut(&href)
            .ok_or_else(|| StoreError::NotFound(href.clone()))?;

        if let Some(etag) = &current.etag {
            if *etag != format!("\"{}\"", stored.version) {
                return Err(StoreError::Api {
                    status: 412,
                    message: format!("{} was modified concurrently", href),
                });
            }
        }

        stored.attributes = attributes.clone();
        stored.version += 1;
        Ok(())
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Delete {
            href: reference.href.clone(),
        });
        inner.check_online()?;
        inner.check_failure(&reference.type_tag, &reference.name)?;

        if inner.objects.remove(&reference.href).is_none() {
            return Err(StoreError::NotFound(reference.href.clone()));
        }

        // Nested objects go with their parent.
        let nested_prefix = format!("{}/", reference.href);
        inner
            .objects
            .retain(|href, _| !href.starts_with(&nested_prefix));
        Ok(())
    }

    async fn children(&self, parent: &Reference, kind: &str) -> Result<Vec<RemoteObject>> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Children {
            parent: parent.href.clone(),
            kind: kind.to_string(),
        });
        inner.check_online()?;

        if !inner.objects.contains_key(&parent.href) {
            return Err(StoreError::NotFound(parent.href.clone()));
        }

        Ok(inner
            .objects
            .values()
            .filter(|o| {
                o.parent.as_deref() == Some(parent.href.as_str()) && o.kind.as_deref() == Some(kind)
            })
            .map(|o| RemoteObject {
                reference: o.reference.clone(),
                attributes: o.attributes.clone(),
                etag: Some(format!("\"{}\"", o.version)),
            })
            .collect())
    }

    async fn create_child(
        &self,
        parent: &Reference,
        kind: &str,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Reference> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::CreateChild {
            parent: parent.href.clone(),
            kind: kind.to_string(),
            name: name.to_string(),
        });
        inner.check_online()?;
        inner.check_failure(kind, name)?;

        if !inner.objects.contains_key(&parent.href) {
            return Err(StoreError::NotFound(parent.href.clone()));
        }

        let href = inner.allocate_href(&format!("{}/{}", parent.href, kind));
        let reference = Reference::new(kind, name, href);
        inner.insert(
            reference.clone(),
            attributes.clone(),
            Some(parent.href.clone()),
            Some(kind.to_string()),
        );
        Ok(reference)
    }
}
