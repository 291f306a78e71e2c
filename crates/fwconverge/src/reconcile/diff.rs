//! Attribute diffing.
//!
//! A declared value that is a list is reconciled as a collection, anything
//! else is replaced when unequal. Attributes the document does not mention
//! are never touched.

use serde::Serialize;
use serde_json::Value;

use crate::document::CollectionPolicy;
use crate::store::Attributes;

/// One attribute that needs a new value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<Value>,
    pub after: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributeDiff {
    pub changes: Vec<FieldChange>,
}

impl AttributeDiff {
    /// Compares declared attributes against the current remote ones.
    pub fn compute(current: &Attributes, declared: &Attributes, policy: CollectionPolicy) -> Self {
        let mut changes = Vec::new();

        for (field, wanted) in declared {
            let existing = current.get(field);
            let after = match wanted {
                Value::Array(items) => reconcile_collection(existing, items, policy),
                _ => {
                    if existing.unwrap_or(&Value::Null) == wanted {
                        None
                    } else {
                        Some(wanted.clone())
                    }
                }
            };

            if let Some(after) = after {
                changes.push(FieldChange {
                    field: field.clone(),
                    before: existing.cloned(),
                    after,
                });
            }
        }

        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Names of the changed attributes.
    pub fn fields(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.field.clone()).collect()
    }

    /// Full attribute map after applying the changes to `current`.
    pub fn apply_to(&self, current: &Attributes) -> Attributes {
        let mut updated = current.clone();
        for change in &self.changes {
            updated.insert(change.field.clone(), change.after.clone());
        }
        updated
    }
}

/// New value of a list attribute, or `None` when nothing changes.
fn reconcile_collection(
    existing: Option<&Value>,
    declared: &[Value],
    policy: CollectionPolicy,
) -> Option<Value> {
    let current: &[Value] = match existing {
        Some(Value::Array(items)) => items,
        _ => &[],
    };

    match policy {
        CollectionPolicy::Merge => {
            let missing: Vec<&Value> = declared.iter().filter(|v| !current.contains(v)).collect();
            let kind_changed = !matches!(existing, Some(Value::Array(_)));
            if missing.is_empty() && !kind_changed {
                return None;
            }
            let mut merged = current.to_vec();
            for value in missing {
                if !merged.contains(value) {
                    merged.push(value.clone());
                }
            }
            Some(Value::Array(merged))
        }
        CollectionPolicy::Overwrite => {
            if existing.is_some() && same_entries(current, declared) {
                None
            } else {
                Some(Value::Array(declared.to_vec()))
            }
        }
    }
}

/// Order-insensitive comparison that respects repeated entries.
fn same_entries(left: &[Value], right: &[Value]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut unmatched: Vec<&Value> = right.iter().collect();
    for value in left {
        match unmatched.iter().position(|v| *v == value) {
            Some(index) => {
                unmatched.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}
