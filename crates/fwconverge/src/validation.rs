//! Validation issues and the structural batch validator.
//!
//! Every check appends to one issue list instead of stopping at the first
//! problem, so a failed pass reports everything that needs fixing at once.

use std::collections::HashSet;

use serde::Serialize;

use crate::document::{ElementDescriptor, Identity};
use crate::registry::Registry;

/// A problem found before any remote mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    UnknownType {
        identity: Identity,
    },
    CompositeType {
        identity: Identity,
    },
    DuplicateIdentity {
        identity: Identity,
    },
    MissingField {
        identity: Identity,
        field: String,
    },
    UnknownField {
        identity: Identity,
        field: String,
    },
    Malformed {
        identity: Identity,
        field: String,
        message: String,
    },
    InvalidTarget {
        identity: Identity,
        field: String,
        target: Identity,
    },
    Unresolved {
        referrer: Identity,
        reference: Identity,
    },
    Ambiguous {
        identity: Identity,
        candidates: usize,
    },
    Deadlock {
        identity: Identity,
        dependency: Identity,
    },
    Invalid {
        subject: String,
        message: String,
    },
}

impl ValidationIssue {
    /// Shorthand for free-form issues about a subject.
    pub fn invalid(subject: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue::Invalid {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::UnknownType { identity } => {
                write!(f, "{}: unknown element type '{}'", identity, identity.type_tag)
            }
            ValidationIssue::CompositeType { identity } => write!(
                f,
                "{}: '{}' is an engine type and must be described by an engine document",
                identity, identity.type_tag
            ),
            ValidationIssue::DuplicateIdentity { identity } => {
                write!(f, "{}: declared more than once", identity)
            }
            ValidationIssue::MissingField { identity, field } => {
                write!(f, "{}: {} is required", identity, field)
            }
            ValidationIssue::UnknownField { identity, field } => {
                write!(f, "{}: unknown attribute '{}'", identity, field)
            }
            ValidationIssue::Malformed {
                identity,
                field,
                message,
            } => write!(f, "{}: {}: {}", identity, field, message),
            ValidationIssue::InvalidTarget {
                identity,
                field,
                target,
            } => write!(
                f,
                "{}: {} cannot reference element type '{}' ({})",
                identity, field, target.type_tag, target
            ),
            ValidationIssue::Unresolved {
                referrer,
                reference,
            } => write!(f, "{}: referenced element {} does not exist", referrer, reference),
            ValidationIssue::Ambiguous {
                identity,
                candidates,
            } => write!(
                f,
                "{}: lookup matched {} elements, narrow the name filter",
                identity, candidates
            ),
            ValidationIssue::Deadlock {
                identity,
                dependency,
            } => write!(
                f,
                "{}: depends on {} which is itself waiting for another element of this batch",
                identity, dependency
            ),
            ValidationIssue::Invalid { subject, message } => write!(f, "{}: {}", subject, message),
        }
    }
}

/// All issues found by one validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Returns `Ok(())` when no issue was recorded.
    pub fn into_result(self) -> std::result::Result<(), ValidationReport> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Extend<ValidationIssue> for ValidationReport {
    fn extend<I: IntoIterator<Item = ValidationIssue>>(&mut self, iter: I) {
        self.issues.extend(iter);
    }
}

impl From<Vec<ValidationIssue>> for ValidationReport {
    fn from(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

/// Structural validation of an element batch against the registry.
///
/// Runs without contacting the management server.
pub struct BatchValidator<'r> {
    registry: &'r Registry,
    report: ValidationReport,
}

impl<'r> BatchValidator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            report: ValidationReport::new(),
        }
    }

    /// Validates every element and returns the collected issues.
    pub fn validate(mut self, elements: &[ElementDescriptor]) -> ValidationReport {
        let mut seen: HashSet<&Identity> = HashSet::new();

        for element in elements {
            if !seen.insert(&element.identity) {
                self.report.push(ValidationIssue::DuplicateIdentity {
                    identity: element.identity.clone(),
                });
            }
            self.validate_element(element);
        }

        self.report
    }

    fn validate_element(&mut self, element: &ElementDescriptor) {
        let identity = &element.identity;

        if identity.name.trim().is_empty() {
            self.report
                .push(ValidationIssue::invalid(identity.to_string(), "name is required"));
        }

        let Some(kind) = self.registry.lookup(&identity.type_tag) else {
            self.report.push(ValidationIssue::UnknownType {
                identity: identity.clone(),
            });
            return;
        };

        if kind.composite {
            self.report.push(ValidationIssue::CompositeType {
                identity: identity.clone(),
            });
            return;
        }

        // Removal only needs the identity.
        if element.is_absent() {
            return;
        }

        self.report.extend(kind.check(identity, &element.attributes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(elements: &[ElementDescriptor]) -> ValidationReport {
        let registry = Registry::builtin();
        BatchValidator::new(&registry).validate(elements)
    }

    #[test]
    fn test_valid_batch() {
        let report = validate(&[
            ElementDescriptor::new("host", "web01").with_attribute("address", "10.0.0.1"),
            ElementDescriptor::new("group", "web")
                .with_attribute("members", json!({"host": ["web01"]})),
        ]);
        assert!(report.is_empty(), "{}", report);
    }

    #[test]
    fn test_duplicate_identity() {
        let report = validate(&[
            ElementDescriptor::new("host", "web01").with_attribute("address", "10.0.0.1"),
            ElementDescriptor::new("host", "web01").with_attribute("address", "10.0.0.2"),
        ]);
        assert_eq!(
            report.issues(),
            &[ValidationIssue::DuplicateIdentity {
                identity: Identity::new("host", "web01")
            }]
        );
    }

    #[test]
    fn test_same_name_different_type_is_not_duplicate() {
        let report = validate(&[
            ElementDescriptor::new("host", "dmz").with_attribute("address", "10.0.0.1"),
            ElementDescriptor::new("network", "dmz").with_attribute("ipv4_network", "10.0.0.0/24"),
        ]);
        assert!(report.is_empty(), "{}", report);
    }

    #[test]
    fn test_unknown_and_composite_types() {
        let report = validate(&[
            ElementDescriptor::new("teleporter", "t1"),
            ElementDescriptor::new("single_fw", "fw1"),
        ]);
        assert!(matches!(
            report.issues()[0],
            ValidationIssue::UnknownType { .. }
        ));
        assert!(matches!(
            report.issues()[1],
            ValidationIssue::CompositeType { .. }
        ));
    }

    #[test]
    fn test_collects_all_issues() {
        let report = validate(&[
            ElementDescriptor::new("host", "web01").with_attribute("colour", "blue"),
            ElementDescriptor::new("external_bgp_peer", "peer1")
                .with_attribute("neighbor_as", json!({"host": "web01"}))
                .with_attribute("neighbor_ip", "9.9.9.9"),
        ]);

        // host: missing address + unknown attribute; peer: invalid target
        assert_eq!(report.len(), 3, "{}", report);
        assert!(report
            .issues()
            .iter()
            .any(|i| matches!(i, ValidationIssue::InvalidTarget { .. })));
    }

    #[test]
    fn test_absent_elements_skip_attribute_checks() {
        let report = validate(&[ElementDescriptor::new("host", "old").absent()]);
        assert!(report.is_empty());
    }

    #[test]
    fn test_report_display_joins_messages() {
        let report = ValidationReport::from(vec![
            ValidationIssue::invalid("a", "first"),
            ValidationIssue::invalid("b", "second"),
        ]);
        assert_eq!(report.to_string(), "a: first; b: second");
        assert!(report.into_result().is_err());
    }
}
