//! Remote object store abstraction.
//!
//! The reconciliation core only talks to the management server through the
//! [`ObjectStore`] trait. Two implementations ship with the crate:
//! - [`SmcClient`]: the HTTP/JSON management API
//! - [`MemoryStore`]: an in-process store used for tests and offline planning

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::SmcClient;
pub use memory::{MemoryStore, StoreCall};

/// Attribute map of a remote object or a declared element.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Scheme used for references that only exist in a dry run.
const PLANNED_SCHEME: &str = "planned://";

/// Handle to an object living on the management server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Element type tag, e.g. `host` or `single_fw`.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Element name.
    pub name: String,
    /// Location of the object. Attribute maps refer to other objects by href.
    pub href: String,
}

impl Reference {
    pub fn new(
        type_tag: impl Into<String>,
        name: impl Into<String>,
        href: impl Into<String>,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            name: name.into(),
            href: href.into(),
        }
    }

    /// A placeholder for an element a dry run would have created.
    pub fn planned(type_tag: &str, name: &str) -> Self {
        Self::new(
            type_tag,
            name,
            format!("{}{}/{}", PLANNED_SCHEME, type_tag, name),
        )
    }

    /// Returns true if this reference was never materialized remotely.
    pub fn is_planned(&self) -> bool {
        self.href.starts_with(PLANNED_SCHEME)
    }
}

/// A fetched remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub reference: Reference,
    pub attributes: Attributes,
    /// Entity tag used for conditional updates, when the server provides one.
    pub etag: Option<String>,
}

/// Name matching behaviour for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Match the full name instead of a substring.
    pub exact: bool,
    pub case_sensitive: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            exact: true,
            case_sensitive: true,
        }
    }
}

impl MatchOptions {
    /// Returns true if `candidate` satisfies a lookup for `wanted`.
    pub fn matches(&self, candidate: &str, wanted: &str) -> bool {
        let (candidate, wanted) = if self.case_sensitive {
            (candidate.to_string(), wanted.to_string())
        } else {
            (candidate.to_lowercase(), wanted.to_lowercase())
        };

        if self.exact {
            candidate == wanted
        } else {
            candidate.contains(&wanted)
        }
    }
}

/// Errors returned by an [`ObjectStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Management API rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response from management API: {0}")]
    Decode(String),

    #[error("No API entry point known for element type '{0}'")]
    UnknownEntryPoint(String),
}

impl StoreError {
    /// Returns true if the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true if the server could not be reached or refused the session.
    ///
    /// These errors make every further call pointless, so lookups propagate
    /// them instead of recording the element as missing.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StoreError::Transport(_) | StoreError::Authentication(_)
        )
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The management API as seen by the reconciliation core.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Looks up top-level elements of `type_tag` by name.
    ///
    /// Returns every candidate; callers decide whether several candidates
    /// are ambiguous.
    async fn find(
        &self,
        type_tag: &str,
        name: &str,
        options: MatchOptions,
    ) -> Result<Vec<Reference>>;

    /// Fetches the current attributes of an object.
    async fn get(&self, reference: &Reference) -> Result<RemoteObject>;

    /// Creates a top-level element.
    async fn create(&self, type_tag: &str, name: &str, attributes: &Attributes)
        -> Result<Reference>;

    /// Replaces the attributes of `current` with `attributes`.
    async fn update(&self, current: &RemoteObject, attributes: &Attributes) -> Result<()>;

    /// Deletes an object and everything nested under it.
    async fn delete(&self, reference: &Reference) -> Result<()>;

    /// Lists the nested objects of `kind` below `parent`.
    async fn children(&self, parent: &Reference, kind: &str) -> Result<Vec<RemoteObject>>;

    /// Creates a nested object of `kind` below `parent`.
    async fn create_child(
        &self,
        parent: &Reference,
        kind: &str,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Reference>;
}
