//! Element descriptors: one named, typed object of a desired-state document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{DocumentError, Result};
use crate::store::Attributes;

/// Attribute keys that steer reconciliation instead of describing the element.
pub const RESERVED_KEYS: &[&str] = &["name", "state", "overwrite_existing"];

/// Identity of an element: its type tag and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub name: String,
}

impl Identity {
    pub fn new(type_tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.type_tag, self.name)
    }
}

/// Whether an element should exist after the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredPresence {
    #[default]
    Present,
    Absent,
}

/// How list-valued attributes are reconciled against an existing object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionPolicy {
    /// Union of existing and declared entries.
    #[default]
    Merge,
    /// Declared entries replace the existing ones.
    Overwrite,
}

/// One desired element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDescriptor {
    pub identity: Identity,
    /// Declared attributes, reserved keys removed.
    pub attributes: Attributes,
    pub state: DesiredPresence,
    pub policy: CollectionPolicy,
}

impl ElementDescriptor {
    /// Creates a present element with no attributes.
    pub fn new(type_tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(type_tag, name),
            attributes: Attributes::new(),
            state: DesiredPresence::Present,
            policy: CollectionPolicy::Merge,
        }
    }

    /// Adds a declared attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Requests removal of the element.
    pub fn absent(mut self) -> Self {
        self.state = DesiredPresence::Absent;
        self
    }

    /// Switches list attributes to exact replacement.
    pub fn overwrite(mut self) -> Self {
        self.policy = CollectionPolicy::Overwrite;
        self
    }

    pub fn type_tag(&self) -> &str {
        &self.identity.type_tag
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn is_absent(&self) -> bool {
        self.state == DesiredPresence::Absent
    }

    /// Parses a document entry: a single-key map `{type_tag: {name, ...}}`.
    pub fn from_entry(entry: &Value) -> Result<Self> {
        let map = entry.as_object().ok_or_else(|| {
            DocumentError::InvalidEntry("entry must be a map of one type tag".to_string())
        })?;

        if map.len() != 1 {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            return Err(DocumentError::InvalidEntry(format!(
                "entry must have exactly one type tag, found [{}]",
                keys.join(", ")
            )));
        }

        // Checked above: exactly one entry.
        let (type_tag, body) = match map.iter().next() {
            Some(pair) => pair,
            None => return Err(DocumentError::InvalidEntry("empty entry".to_string())),
        };

        let body = body.as_object().ok_or_else(|| {
            DocumentError::InvalidEntry(format!("'{}' entry must be a map", type_tag))
        })?;

        let name = match body.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            Some(Value::String(_)) | None => {
                return Err(DocumentError::InvalidEntry(format!(
                    "'{}' entry is missing a name",
                    type_tag
                )))
            }
            Some(other) => {
                return Err(DocumentError::InvalidEntry(format!(
                    "'{}' entry name must be a string, found {}",
                    type_tag, other
                )))
            }
        };

        let state = match body.get("state") {
            None => DesiredPresence::Present,
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                DocumentError::InvalidEntry(format!(
                    "{}/{}: state must be 'present' or 'absent'",
                    type_tag, name
                ))
            })?,
        };

        let policy = match body.get("overwrite_existing") {
            None | Some(Value::Bool(false)) => CollectionPolicy::Merge,
            Some(Value::Bool(true)) => CollectionPolicy::Overwrite,
            Some(_) => {
                return Err(DocumentError::InvalidEntry(format!(
                    "{}/{}: overwrite_existing must be a boolean",
                    type_tag, name
                )))
            }
        };

        let attributes = body
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            identity: Identity::new(type_tag.clone(), name),
            attributes,
            state,
            policy,
        })
    }

    /// Renders the descriptor back into its document form.
    pub fn to_entry(&self) -> Value {
        let mut body = self.attributes.clone();
        body.insert("name".to_string(), Value::String(self.identity.name.clone()));
        if self.state == DesiredPresence::Absent {
            body.insert("state".to_string(), Value::String("absent".to_string()));
        }
        if self.policy == CollectionPolicy::Overwrite {
            body.insert("overwrite_existing".to_string(), Value::Bool(true));
        }

        let mut entry = serde_json::Map::new();
        entry.insert(self.identity.type_tag.clone(), Value::Object(body));
        Value::Object(entry)
    }
}
