//! Document loading errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading a desired-state document.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document path not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read document directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Document '{path}' does not match the element schema: {errors}")]
    Schema { path: PathBuf, errors: String },

    #[error("Invalid element entry: {0}")]
    InvalidEntry(String),

    #[error("Invalid entry #{index} in '{path}': {message}")]
    InvalidEntryAt {
        path: PathBuf,
        index: usize,
        message: String,
    },

    #[error("Embedded schema is unusable: {0}")]
    EmbeddedSchema(String),
}

/// Result type for document operations.
pub type Result<T> = std::result::Result<T, DocumentError>;
