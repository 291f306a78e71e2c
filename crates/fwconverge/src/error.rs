use std::path::PathBuf;
use thiserror::Error;

use crate::changelog::ChangeLog;
use crate::document::DocumentError;
use crate::secrets::SecretError;
use crate::store::StoreError;
use crate::validation::ValidationReport;

#[derive(Error, Debug)]
pub enum ConvergeError {
    /// The desired state failed validation; nothing was changed remotely.
    #[error("Validation failed: {0}")]
    Validation(ValidationReport),

    /// Mutation started and had to stop. `applied` holds what was done.
    #[error("Pass aborted during {stage}: {reason}")]
    Aborted {
        stage: String,
        reason: String,
        applied: ChangeLog,
    },

    #[error("Management API error: {0}")]
    Store(#[from] StoreError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ConvergeError {
    /// Returns true if the pass stopped before issuing any mutating call.
    pub fn is_pre_mutation(&self) -> bool {
        match self {
            ConvergeError::Aborted { applied, .. } => applied.is_empty(),
            _ => true,
        }
    }
}

impl From<ValidationReport> for ConvergeError {
    fn from(report: ValidationReport) -> Self {
        ConvergeError::Validation(report)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve API key: {0}")]
    Secret(#[from] SecretError),
}

pub type Result<T> = std::result::Result<T, ConvergeError>;
