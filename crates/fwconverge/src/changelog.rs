//! Change records and pass outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Identity;

/// What a pass did to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Modified,
    Deleted,
    Failed,
    /// No change was needed. Only recorded on request.
    Unchanged,
}

impl Action {
    /// Returns true for actions that changed remote state.
    pub fn is_change(&self) -> bool {
        matches!(self, Action::Created | Action::Modified | Action::Deleted)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Modified => "modified",
            Action::Deleted => "deleted",
            Action::Failed => "failed",
            Action::Unchanged => "unchanged",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Attributes a modification touched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Sub-resource the record belongs to, e.g. an engine stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ChangeRecord {
    pub fn new(type_tag: impl Into<String>, name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            action,
            reason: None,
            fields: Vec::new(),
            scope: None,
        }
    }

    pub fn for_identity(identity: &Identity, action: Action) -> Self {
        Self::new(identity.type_tag.clone(), identity.name.clone(), action)
    }

    pub fn failed(identity: &Identity, reason: impl Into<String>) -> Self {
        Self::for_identity(identity, Action::Failed).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.type_tag.clone(), self.name.clone())
    }
}

/// Append-only list of change records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeLog {
    records: Vec<ChangeRecord>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: ChangeRecord) {
        self.records.push(entry);
    }

    /// Returns true if any record changed remote state.
    pub fn any(&self) -> bool {
        self.records.iter().any(|r| r.action.is_change())
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records
    }

    /// Records of one sub-resource, in recording order.
    pub fn scoped<'a>(&'a self, scope: &'a str) -> impl Iterator<Item = &'a ChangeRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.scope.as_deref() == Some(scope))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(|r| r.action == Action::Failed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Extend<ChangeRecord> for ChangeLog {
    fn extend<I: IntoIterator<Item = ChangeRecord>>(&mut self, iter: I) {
        self.records.extend(iter);
    }
}

/// Result of one convergence pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub pass_id: Uuid,
    pub changed: bool,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: Vec<ChangeRecord>,
}

impl Outcome {
    /// Closes a pass: `changed` is derived from the log.
    pub fn finish(pass_id: Uuid, dry_run: bool, started_at: DateTime<Utc>, log: ChangeLog) -> Self {
        Self {
            pass_id,
            changed: log.any(),
            dry_run,
            started_at,
            finished_at: Utc::now(),
            state: log.into_records(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.state.iter().filter(|r| r.action == Action::Failed)
    }
}
