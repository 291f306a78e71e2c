//! Two-round scheduling of a batch.
//!
//! Elements whose references point at siblings created in the same pass
//! are deferred until the first round has been applied. There is exactly one
//! deferred round: a deferred element waiting for another deferred element
//! (longer chains, cycles, self references) is a deadlock and fails
//! validation.

use std::collections::HashSet;

use crate::document::{ElementDescriptor, Identity};
use crate::registry::Registry;
use crate::resolve::{ReferenceCache, Resolution};
use crate::validation::ValidationIssue;

/// A batch split into two rounds, each in caller order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub immediate: Vec<ElementDescriptor>,
    pub deferred: Vec<ElementDescriptor>,
}

/// Splits a batch into an immediate and a deferred round.
///
/// Every reference must already be in the cache; `Pending` entries mark the
/// siblings this pass will create.
pub fn partition(
    elements: Vec<ElementDescriptor>,
    registry: &Registry,
    cache: &ReferenceCache<'_>,
) -> Result<Schedule, Vec<ValidationIssue>> {
    let mut schedule = Schedule::default();
    let mut waiting_on: Vec<Vec<Identity>> = Vec::new();

    for element in elements {
        let pending: Vec<Identity> = registry
            .references_of(&element)
            .into_iter()
            .filter(|r| matches!(cache.cached(r), Some(Resolution::Pending)))
            .collect();

        if pending.is_empty() {
            schedule.immediate.push(element);
        } else {
            waiting_on.push(pending);
            schedule.deferred.push(element);
        }
    }

    let deferred_ids: HashSet<&Identity> = schedule.deferred.iter().map(|e| &e.identity).collect();
    let mut issues = Vec::new();
    for (element, pending) in schedule.deferred.iter().zip(&waiting_on) {
        for dependency in pending {
            if deferred_ids.contains(dependency) {
                issues.push(ValidationIssue::Deadlock {
                    identity: element.identity.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    if issues.is_empty() {
        Ok(schedule)
    } else {
        Err(issues)
    }
}

/// Second round check: every reference of the deferred elements must now
/// resolve. Unresolved ones join the cache's missing set.
pub fn repartition(
    deferred: &[ElementDescriptor],
    registry: &Registry,
    cache: &mut ReferenceCache<'_>,
) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    for element in deferred {
        for reference in registry.references_of(element) {
            if cache.reference(&reference).is_none() {
                cache.note_missing(&reference);
                issues.push(ValidationIssue::Unresolved {
                    referrer: element.identity.clone(),
                    reference,
                });
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
