//! Batch convergence passes.
//!
//! One pass over a flat element document:
//!
//! 1. structural validation against the registry
//! 2. existence probe for every element, reference resolution
//! 3. scheduling into an immediate and a deferred round
//! 4. reconciliation of the immediate round, then of the deferred one
//!
//! Steps 1 to 3 never mutate remote state; any issue found there fails the
//! pass with a [`ConvergeError::Validation`].

use chrono::Utc;
use serde::Serialize;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::changelog::{Action, ChangeLog, ChangeRecord, Outcome};
use crate::document::{ElementDescriptor, Identity};
use crate::engine::{EngineOrchestrator, EngineSpec};
use crate::error::{ConvergeError, Result};
use crate::reconcile::{reconcile_children, ElementReconciler};
use crate::registry::Registry;
use crate::resolve::{ReferenceCache, Resolution};
use crate::schedule::{partition, repartition, Schedule};
use crate::store::{MatchOptions, ObjectStore};
use crate::validation::{BatchValidator, ValidationIssue, ValidationReport};

/// Knobs of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// Run lookups and diffs, skip mutating calls.
    pub dry_run: bool,
    /// Also record elements that needed no change.
    pub record_unchanged: bool,
    pub match_options: MatchOptions,
}

/// What a pass would do, computed without reconciling anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub elements: usize,
    pub existing: usize,
    pub to_create: usize,
    pub to_delete: usize,
    /// Elements waiting for a sibling created in the same pass.
    pub deferred: Vec<Identity>,
    pub lookups: usize,
}

/// Runs convergence passes against one store.
pub struct Converger<'a> {
    store: &'a dyn ObjectStore,
    registry: &'a Registry,
    options: PassOptions,
}

impl<'a> Converger<'a> {
    pub fn new(store: &'a dyn ObjectStore, registry: &'a Registry) -> Self {
        Self {
            store,
            registry,
            options: PassOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PassOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> PassOptions {
        self.options
    }

    /// Converges a batch of elements.
    pub async fn converge(&self, elements: Vec<ElementDescriptor>) -> Result<Outcome> {
        let pass_id = Uuid::new_v4();
        let span = info_span!(
            "converge",
            pass_id = %pass_id,
            elements = elements.len(),
            dry_run = self.options.dry_run,
        );
        self.run(pass_id, elements).instrument(span).await
    }

    async fn run(&self, pass_id: Uuid, elements: Vec<ElementDescriptor>) -> Result<Outcome> {
        let started_at = Utc::now();

        let mut cache = ReferenceCache::new(self.store, self.options.match_options);
        let schedule = self.prepare(elements, &mut cache).await?;

        log::info!(
            "Applying {} element(s), {} deferred",
            schedule.immediate.len(),
            schedule.deferred.len()
        );

        let reconciler = ElementReconciler::new(self.store, self.registry).dry_run(self.options.dry_run);
        let mut log = ChangeLog::new();

        for element in &schedule.immediate {
            self.apply_one(&reconciler, element, &mut cache, &mut log).await;
        }

        if !schedule.deferred.is_empty() {
            if let Err(issues) = repartition(&schedule.deferred, self.registry, &mut cache) {
                let report = ValidationReport::from(issues);
                log::error!("Deferred round cannot run: {}", report);
                return Err(ConvergeError::Aborted {
                    stage: "deferred round".to_string(),
                    reason: report.to_string(),
                    applied: log,
                });
            }

            for element in &schedule.deferred {
                self.apply_one(&reconciler, element, &mut cache, &mut log).await;
            }
        }

        let outcome = Outcome::finish(pass_id, self.options.dry_run, started_at, log);
        log::info!(
            "Pass finished: changed={}, {} record(s), {} failure(s)",
            outcome.changed,
            outcome.state.len(),
            outcome.failures().count()
        );
        Ok(outcome)
    }

    /// Validates and schedules a batch without reconciling it.
    pub async fn plan(&self, elements: Vec<ElementDescriptor>) -> Result<PlanSummary> {
        let mut cache = ReferenceCache::new(self.store, self.options.match_options);
        let count = elements.len();
        let schedule = self.prepare(elements, &mut cache).await?;

        let mut summary = PlanSummary {
            elements: count,
            deferred: schedule.deferred.iter().map(|e| e.identity.clone()).collect(),
            lookups: cache.lookups(),
            ..PlanSummary::default()
        };

        for element in schedule.immediate.iter().chain(&schedule.deferred) {
            let exists = matches!(cache.cached(&element.identity), Some(Resolution::Resolved(_)));
            match (element.is_absent(), exists) {
                (true, true) => summary.to_delete += 1,
                (false, true) => summary.existing += 1,
                (false, false) => summary.to_create += 1,
                (true, false) => {}
            }
        }

        Ok(summary)
    }

    /// Converges one engine description.
    pub async fn converge_engine(&self, spec: &EngineSpec) -> Result<Outcome> {
        EngineOrchestrator::new(self.store, self.registry)
            .with_options(self.options)
            .converge(spec)
            .await
    }

    /// Steps 1 to 3: everything that must succeed before the first mutation.
    async fn prepare(
        &self,
        elements: Vec<ElementDescriptor>,
        cache: &mut ReferenceCache<'_>,
    ) -> Result<Schedule> {
        BatchValidator::new(self.registry)
            .validate(&elements)
            .into_result()?;

        let mut report = ValidationReport::new();

        for element in &elements {
            match cache.probe(&element.identity).await? {
                Resolution::Missing if !element.is_absent() => cache.mark_pending(&element.identity),
                Resolution::Ambiguous(candidates) => report.push(ValidationIssue::Ambiguous {
                    identity: element.identity.clone(),
                    candidates,
                }),
                _ => {}
            }
        }

        let removed: Vec<&Identity> = elements
            .iter()
            .filter(|e| e.is_absent())
            .map(|e| &e.identity)
            .collect();

        for element in &elements {
            for reference in self.registry.references_of(element) {
                if removed.contains(&&reference) {
                    report.push(ValidationIssue::invalid(
                        element.identity.to_string(),
                        format!("references {} which this pass removes", reference),
                    ));
                    continue;
                }

                match cache.resolve(&reference).await? {
                    Resolution::Missing => report.push(ValidationIssue::Unresolved {
                        referrer: element.identity.clone(),
                        reference,
                    }),
                    Resolution::Ambiguous(candidates) => report.push(ValidationIssue::Ambiguous {
                        identity: reference,
                        candidates,
                    }),
                    Resolution::Resolved(_) | Resolution::Pending => {}
                }
            }
        }

        if !cache.is_clean() {
            log::warn!("{} unresolved reference(s)", cache.missing().len());
        }
        report.into_result()?;

        partition(elements, self.registry, cache)
            .map_err(|issues| ConvergeError::Validation(issues.into()))
    }

    async fn apply_one(
        &self,
        reconciler: &ElementReconciler<'_>,
        element: &ElementDescriptor,
        cache: &mut ReferenceCache<'_>,
        log: &mut ChangeLog,
    ) {
        let record = reconciler.apply(element, cache).await;
        let failed = record.action == Action::Failed;
        self.keep(log, record);

        if failed || element.is_absent() {
            return;
        }

        let children = self
            .registry
            .lookup(element.type_tag())
            .and_then(|kind| kind.children);
        let parent = cache.reference(&element.identity).cloned();

        if let (Some(spec), Some(parent)) = (children, parent) {
            let records =
                reconcile_children(self.store, spec, &parent, element, cache, self.options.dry_run)
                    .await;
            for record in records {
                self.keep(log, record);
            }
        }
    }

    fn keep(&self, log: &mut ChangeLog, record: ChangeRecord) {
        if record.action != Action::Unchanged || self.options.record_unchanged {
            log.record(record);
        }
    }
}
