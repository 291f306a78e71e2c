//! Desired-state document loader.
//!
//! A document is either a single YAML/JSON file or a directory of them.
//! Directories are walked in path order so the element order, which the
//! reconciliation relies on, is stable across runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde_json::Value;
use walkdir::WalkDir;

use super::descriptor::ElementDescriptor;
use super::error::{DocumentError, Result};

const SCHEMA_JSON: &str = include_str!("../../schema/elements-v1.json");

static ELEMENT_SCHEMA: LazyLock<std::result::Result<jsonschema::Validator, String>> =
    LazyLock::new(|| {
        let schema: Value = serde_json::from_str(SCHEMA_JSON)
            .map_err(|e| format!("invalid embedded schema JSON: {}", e))?;
        jsonschema::validator_for(&schema)
            .map_err(|e| format!("failed to compile element schema: {}", e))
    });

/// Elements loaded from one or more files, in document order.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub elements: Vec<ElementDescriptor>,
    /// Files the elements were read from, in load order.
    pub sources: Vec<PathBuf>,
}

impl DesiredState {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }
}

/// Loads desired-state documents from disk.
pub struct DocumentLoader {
    root: PathBuf,
}

impl DocumentLoader {
    /// Creates a loader for a file or a directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads every element below the root.
    pub fn load(&self) -> Result<DesiredState> {
        if !self.root.exists() {
            return Err(DocumentError::NotFound(self.root.clone()));
        }

        if self.root.is_file() {
            let elements = self.load_file(&self.root)?;
            return Ok(DesiredState {
                elements,
                sources: vec![self.root.clone()],
            });
        }

        let mut state = DesiredState::default();

        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| DocumentError::ReadDirectory {
                path: self.root.clone(),
                source: e,
            })?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            // Skip hidden files and anything inside hidden directories
            if let Ok(relative) = path.strip_prefix(&self.root) {
                let hidden = relative.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
                });
                if hidden {
                    continue;
                }
            }

            if !is_document_file(path) {
                continue;
            }

            let elements = self.load_file(path).inspect_err(|e| {
                log::warn!("Failed to load {}: {}", path.display(), e);
            })?;
            log::debug!("Loaded {} element(s) from {}", elements.len(), path.display());

            state.elements.extend(elements);
            state.sources.push(path.to_path_buf());
        }

        Ok(state)
    }

    /// Loads the elements of a single file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<ElementDescriptor>> {
        let content = fs::read_to_string(path).map_err(|e| DocumentError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        parse_document(&content, path)
    }
}

fn is_document_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Parses a document. JSON is accepted as a subset of YAML.
pub fn parse_document(content: &str, path: &Path) -> Result<Vec<ElementDescriptor>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_yaml::from_str(content).map_err(|e| DocumentError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if value.is_null() {
        return Ok(Vec::new());
    }

    validate_schema(&value, path)?;

    let entries = match &value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("elements") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            ElementDescriptor::from_entry(entry).map_err(|e| DocumentError::InvalidEntryAt {
                path: path.to_path_buf(),
                index,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Checks the overall document shape against the embedded schema.
pub fn validate_schema(value: &Value, path: &Path) -> Result<()> {
    let validator = ELEMENT_SCHEMA
        .as_ref()
        .map_err(|e| DocumentError::EmbeddedSchema(e.clone()))?;

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DocumentError::Schema {
            path: path.to_path_buf(),
            errors: errors.join("; "),
        })
    }
}
