//! Desired-state documents.
//!
//! A document is an ordered list of typed records, each a single-key map
//! from a type tag to the element's attributes:
//!
//! ```yaml
//! - autonomous_system:
//!     name: as-200
//!     as_number: "200"
//! - group:
//!     name: web-servers
//!     members:
//!       host: [web01, web02]
//! ```

pub mod descriptor;
pub mod error;
pub mod loader;

pub use descriptor::{
    CollectionPolicy, DesiredPresence, ElementDescriptor, Identity, RESERVED_KEYS,
};
pub use error::{DocumentError, Result};
pub use loader::{parse_document, validate_schema, DesiredState, DocumentLoader};
