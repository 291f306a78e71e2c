pub mod changelog;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod pass;
pub mod reconcile;
pub mod registry;
pub mod resolve;
pub mod schedule;
pub mod secrets;
pub mod store;
pub mod validation;

pub use changelog::{Action, ChangeLog, ChangeRecord, Outcome};
pub use config::ClientConfig;
pub use document::{
    CollectionPolicy, DesiredPresence, DesiredState, DocumentError, DocumentLoader,
    ElementDescriptor, Identity,
};
pub use engine::{EngineOrchestrator, EngineSpec, EngineType, Stage};
pub use error::{ConfigError, ConvergeError, Result};
pub use pass::{Converger, PassOptions, PlanSummary};
pub use registry::{ElementKind, FieldShape, Registry};
pub use resolve::{ReferenceCache, Resolution};
pub use secrets::{ApiKeySource, SecretError};
pub use store::{
    Attributes, MatchOptions, MemoryStore, ObjectStore, Reference, RemoteObject, SmcClient, StoreError,
};
pub use validation::{BatchValidator, ValidationIssue, ValidationReport};
