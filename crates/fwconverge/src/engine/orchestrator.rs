//! Staged engine convergence.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::spec::{EngineSpec, InterfaceId};
use super::validate::{self, EngineReference};
use super::{interfaces, routing, vpn, Stage};
use crate::changelog::{Action, ChangeLog, ChangeRecord, Outcome};
use crate::document::{CollectionPolicy, Identity};
use crate::error::{ConvergeError, Result};
use crate::pass::PassOptions;
use crate::reconcile::AttributeDiff;
use crate::registry::Registry;
use crate::resolve::{ReferenceCache, Resolution};
use crate::store::{self, Attributes, ObjectStore, Reference, RemoteObject};
use crate::validation::{ValidationIssue, ValidationReport};

/// Scope of the record written when the engine itself is created.
const ENGINE_SCOPE: &str = "engine";

/// State shared by the stages of one engine pass.
pub(crate) struct EngineContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub cache: ReferenceCache<'a>,
    pub identity: Identity,
    pub engine: Reference,
    /// Engine attributes as far as this pass knows them. Only read while the
    /// engine exists in a dry run alone.
    pub snapshot: Attributes,
    /// Interfaces present before the pass started.
    pub live_interfaces: Vec<RemoteObject>,
    pub options: PassOptions,
    pub log: ChangeLog,
}

impl EngineContext<'_> {
    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    pub fn href(&self, identity: &Identity) -> Option<String> {
        self.cache.reference(identity).map(|r| r.href.clone())
    }

    /// Hrefs of already validated references.
    pub fn hrefs<'i>(&self, identities: impl IntoIterator<Item = &'i Identity>) -> Vec<Value> {
        identities
            .into_iter()
            .filter_map(|id| self.href(id))
            .map(Value::String)
            .collect()
    }

    pub fn record(&mut self, record: ChangeRecord) {
        if record.action != Action::Unchanged || self.options.record_unchanged {
            self.log.record(record);
        }
    }

    /// A record about the engine itself.
    pub fn engine_record(&self, stage: Stage, action: Action) -> ChangeRecord {
        ChangeRecord::for_identity(&self.identity, action).with_scope(stage.name())
    }

    /// Stops the pass, handing over what was applied so far.
    pub fn abort(&mut self, stage: Stage, reason: impl std::fmt::Display) -> ConvergeError {
        let reason = reason.to_string();
        log::error!("Engine {} aborted in stage {}: {}", self.identity, stage, reason);
        let record = self
            .engine_record(stage, Action::Failed)
            .with_reason(reason.clone());
        self.log.record(record);
        ConvergeError::Aborted {
            stage: stage.name().to_string(),
            reason,
            applied: std::mem::take(&mut self.log),
        }
    }

    /// Current engine object. A planned engine is served from the snapshot.
    pub async fn current(&self) -> store::Result<RemoteObject> {
        if self.engine.is_planned() {
            return Ok(RemoteObject {
                reference: self.engine.clone(),
                attributes: self.snapshot.clone(),
                etag: None,
            });
        }
        self.store.get(&self.engine).await
    }

    /// Children of the engine. A planned engine has none.
    pub async fn engine_children(&self, kind: &str) -> store::Result<Vec<RemoteObject>> {
        if self.engine.is_planned() {
            return Ok(Vec::new());
        }
        self.store.children(&self.engine, kind).await
    }

    /// Brings the declared engine attributes of one stage in line.
    ///
    /// Issues at most one update. A failed read or update aborts the pass.
    pub async fn patch(&mut self, stage: Stage, patch: Attributes, policy: CollectionPolicy) -> Result<()> {
        let current = match self.current().await {
            Ok(current) => current,
            Err(e) => return Err(self.abort(stage, e)),
        };
        self.patch_current(stage, current, patch, policy).await
    }

    pub async fn patch_current(
        &mut self,
        stage: Stage,
        current: RemoteObject,
        patch: Attributes,
        policy: CollectionPolicy,
    ) -> Result<()> {
        let diff = AttributeDiff::compute(&current.attributes, &patch, policy);
        if diff.is_empty() {
            log::debug!("Engine {}: {} already converged", self.identity, stage);
            let record = self.engine_record(stage, Action::Unchanged);
            self.record(record);
            return Ok(());
        }

        let updated = diff.apply_to(&current.attributes);
        if !self.dry_run() {
            if let Err(e) = self.store.update(&current, &updated).await {
                return Err(self.abort(stage, e));
            }
        }
        self.snapshot = updated;

        log::info!(
            "Engine {}: {} updated ({})",
            self.identity,
            stage,
            diff.fields().join(", ")
        );
        let record = self
            .engine_record(stage, Action::Modified)
            .with_fields(diff.fields());
        self.record(record);
        Ok(())
    }
}

/// Converges one engine document.
pub struct EngineOrchestrator<'a> {
    store: &'a dyn ObjectStore,
    registry: &'a Registry,
    options: PassOptions,
}

impl<'a> EngineOrchestrator<'a> {
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

    pub async fn converge(&self, spec: &EngineSpec) -> Result<Outcome> {
        let pass_id = Uuid::new_v4();
        let span = info_span!(
            "engine",
            pass_id = %pass_id,
            engine = %spec.identity(),
            dry_run = self.options.dry_run,
        );
        self.run(pass_id, spec).instrument(span).await
    }

    async fn run(&self, pass_id: Uuid, spec: &EngineSpec) -> Result<Outcome> {
        let started_at = Utc::now();
        let mut cache = ReferenceCache::new(self.store, self.options.match_options);

        let (existing, live_interfaces) = self.validate(spec, &mut cache).await?;

        let mut ctx = EngineContext {
            store: self.store,
            cache,
            identity: spec.identity(),
            engine: Reference::planned(spec.engine_type.tag(), &spec.name),
            snapshot: Attributes::new(),
            live_interfaces,
            options: self.options,
            log: ChangeLog::new(),
        };

        match existing {
            Some(reference) => ctx.engine = reference,
            None => self.create_engine(spec, &mut ctx).await?,
        }

        for stage in Stage::ORDER {
            if !stage.is_requested(spec) {
                continue;
            }
            let span = info_span!("stage", stage = stage.name());
            run_stage(stage, spec, &mut ctx).instrument(span).await?;
        }

        let outcome = Outcome::finish(pass_id, self.options.dry_run, started_at, ctx.log);
        log::info!(
            "Engine {} converged: changed={}, {} record(s)",
            spec.identity(),
            outcome.changed,
            outcome.state.len()
        );
        Ok(outcome)
    }

    /// Checks the whole document and resolves every reference.
    ///
    /// Returns the engine reference, if the engine exists, and its interfaces.
    async fn validate(
        &self,
        spec: &EngineSpec,
        cache: &mut ReferenceCache<'a>,
    ) -> Result<(Option<Reference>, Vec<RemoteObject>)> {
        let identity = spec.identity();
        let mut report = ValidationReport::new();

        let existing = match cache.probe(&identity).await? {
            Resolution::Resolved(reference) => Some(reference),
            Resolution::Ambiguous(candidates) => {
                report.push(ValidationIssue::Ambiguous {
                    identity: identity.clone(),
                    candidates,
                });
                None
            }
            Resolution::Missing | Resolution::Pending => None,
        };

        let live_interfaces = match &existing {
            Some(reference) => self.store.children(reference, "interface").await?,
            None => Vec::new(),
        };
        let live_ids: Vec<String> = live_interfaces
            .iter()
            .map(|i| i.reference.name.clone())
            .collect();

        report.extend(validate::check(spec, self.registry, &live_ids));

        for EngineReference { field, identity: target } in validate::references(spec) {
            match cache.resolve(&target).await? {
                Resolution::Resolved(_) | Resolution::Pending => {}
                Resolution::Missing => {
                    log::debug!("{} of {} not found: {}", field, identity, target);
                    report.push(ValidationIssue::Unresolved {
                        referrer: identity.clone(),
                        reference: target,
                    });
                }
                Resolution::Ambiguous(candidates) => report.push(ValidationIssue::Ambiguous {
                    identity: target,
                    candidates,
                }),
            }
        }

        for category in validate::categories(spec) {
            if let Resolution::Ambiguous(candidates) = cache.probe(&category).await? {
                report.push(ValidationIssue::Ambiguous {
                    identity: category,
                    candidates,
                });
            }
        }

        report.into_result()?;
        Ok((existing, live_interfaces))
    }

    async fn create_engine(&self, spec: &EngineSpec, ctx: &mut EngineContext<'a>) -> Result<()> {
        let attributes = general_attributes(spec);

        if !ctx.dry_run() {
            match self
                .store
                .create(spec.engine_type.tag(), &spec.name, &attributes)
                .await
            {
                Ok(reference) => ctx.engine = reference,
                Err(e) => {
                    log::error!("Failed to create engine {}: {}", ctx.identity, e);
                    let record = ChangeRecord::failed(&ctx.identity, e.to_string()).with_scope(ENGINE_SCOPE);
                    ctx.log.record(record);
                    return Err(ConvergeError::Aborted {
                        stage: ENGINE_SCOPE.to_string(),
                        reason: e.to_string(),
                        applied: std::mem::take(&mut ctx.log),
                    });
                }
            }
        }

        log::info!("Created engine {}", ctx.identity);
        ctx.snapshot = attributes;
        ctx.log
            .record(ChangeRecord::for_identity(&ctx.identity, Action::Created).with_scope(ENGINE_SCOPE));
        Ok(())
    }
}

async fn run_stage(stage: Stage, spec: &EngineSpec, ctx: &mut EngineContext<'_>) -> Result<()> {
    match stage {
        Stage::GeneralFeatures => {
            ctx.patch(stage, general_attributes(spec), CollectionPolicy::Merge)
                .await
        }
        Stage::Snmp => {
            let patch = snmp_attributes(spec, ctx);
            ctx.patch(stage, patch, CollectionPolicy::Merge).await
        }
        Stage::Location => {
            let mut patch = Attributes::new();
            if let Some(location) = &spec.location {
                let href = ctx.href(&Identity::new("location", location.clone()));
                patch.insert("location_ref".to_string(), json!(href));
            }
            ctx.patch(stage, patch, CollectionPolicy::Merge).await
        }
        Stage::Interfaces => interfaces::reconcile(spec, ctx).await,
        Stage::DynamicRouting => routing::reconcile_dynamic_routing(spec, ctx).await,
        Stage::RoutingAttachments => {
            routing::reconcile_attachments(spec, ctx).await;
            Ok(())
        }
        Stage::Antispoofing => {
            let mut patch = Attributes::new();
            let refs = spec.antispoofing_refs();
            patch.insert("antispoofing".to_string(), Value::Array(ctx.hrefs(&refs)));
            ctx.patch(stage, patch, list_policy(spec)).await
        }
        Stage::PolicyVpn => {
            vpn::reconcile_memberships(spec, ctx).await;
            Ok(())
        }
        Stage::Tags => reconcile_tags(spec, ctx).await,
    }
}

/// Policy for engine lists the document may want replaced.
pub(crate) fn list_policy(spec: &EngineSpec) -> CollectionPolicy {
    if spec.overwrite_existing {
        CollectionPolicy::Overwrite
    } else {
        CollectionPolicy::Merge
    }
}

fn general_attributes(spec: &EngineSpec) -> Attributes {
    let mut attributes = Attributes::new();
    for (key, value) in [
        ("antivirus", spec.antivirus),
        ("default_nat", spec.default_nat),
        ("file_reputation", spec.file_reputation),
    ] {
        if let Some(enabled) = value {
            attributes.insert(key.to_string(), Value::Bool(enabled));
        }
    }
    attributes
}

fn snmp_attributes(spec: &EngineSpec, ctx: &EngineContext<'_>) -> Attributes {
    let mut patch = Attributes::new();
    let Some(snmp) = &spec.snmp else {
        return patch;
    };

    let value = if snmp.enabled {
        let agent = snmp
            .snmp_agent
            .as_ref()
            .and_then(|name| ctx.href(&Identity::new("snmp_agent", name.clone())));
        let interfaces: Vec<String> = snmp
            .snmp_interface
            .iter()
            .map(|id| InterfaceId::normalize(id))
            .collect();
        json!({
            "enabled": true,
            "snmp_agent": agent,
            "snmp_location": snmp.snmp_location,
            "snmp_interface": interfaces,
        })
    } else {
        json!({ "enabled": false })
    };
    patch.insert("snmp".to_string(), value);
    patch
}

/// Attaches category tags, creating categories that do not exist yet.
async fn reconcile_tags(spec: &EngineSpec, ctx: &mut EngineContext<'_>) -> Result<()> {
    let categories = validate::categories(spec);

    for category in &categories {
        if ctx.cache.reference(category).is_some() {
            continue;
        }

        let reference = if ctx.dry_run() {
            Reference::planned(&category.type_tag, &category.name)
        } else {
            match ctx
                .store
                .create(&category.type_tag, &category.name, &Attributes::new())
                .await
            {
                Ok(reference) => reference,
                Err(e) => return Err(ctx.abort(Stage::Tags, format!("creating {}: {}", category, e))),
            }
        };

        log::info!("Created category {}", category.name);
        ctx.cache.materialize(category, reference);
        ctx.record(ChangeRecord::for_identity(category, Action::Created).with_scope(Stage::Tags.name()));
    }

    let mut patch = Attributes::new();
    patch.insert("tags".to_string(), Value::Array(ctx.hrefs(&categories)));
    ctx.patch(Stage::Tags, patch, CollectionPolicy::Merge).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec::{EngineType, InterfaceSpec, NodeAddress, SnmpSpec};
    use crate::store::{MatchOptions, MemoryStore, StoreCall};

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    fn spec() -> EngineSpec {
        EngineSpec {
            name: "fw1".to_string(),
            engine_type: EngineType::SingleFw,
            antivirus: Some(true),
            location: Some("dc".to_string()),
            ..EngineSpec::default()
        }
    }

    async fn converge(store: &MemoryStore, spec: &EngineSpec, options: PassOptions) -> Result<Outcome> {
        let registry = Registry::builtin();
        EngineOrchestrator::new(store, &registry)
            .with_options(options)
            .converge(spec)
            .await
    }

    #[tokio::test]
    async fn test_creates_missing_engine_then_runs_stages() {
        let store = MemoryStore::new();
        let location = store.seed("location", "dc", Attributes::new());

        let outcome = converge(&store, &spec(), PassOptions::default()).await.unwrap();

        let scopes: Vec<(&str, Action)> = outcome
            .state
            .iter()
            .map(|r| (r.scope.as_deref().unwrap_or(""), r.action))
            .collect();
        assert_eq!(
            scopes,
            vec![("engine", Action::Created), ("location", Action::Modified)]
        );

        let engine = store.attributes_of("single_fw", "fw1").unwrap();
        assert_eq!(engine["antivirus"], json!(true));
        assert_eq!(engine["location_ref"], json!(location.href));
    }

    #[tokio::test]
    async fn test_second_run_is_unchanged() {
        let store = MemoryStore::new();
        store.seed("location", "dc", Attributes::new());
        converge(&store, &spec(), PassOptions::default()).await.unwrap();
        store.clear_journal();

        let outcome = converge(&store, &spec(), PassOptions::default()).await.unwrap();
        assert!(!outcome.changed);
        assert!(outcome.state.is_empty());
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_reference_blocks_every_stage() {
        let store = MemoryStore::new();
        let mut spec = spec();
        spec.snmp = Some(SnmpSpec {
            enabled: true,
            snmp_agent: Some("agent".to_string()),
            ..SnmpSpec::default()
        });

        let err = converge(&store, &spec, PassOptions::default()).await.unwrap_err();
        match err {
            ConvergeError::Validation(report) => {
                let text = report.to_string();
                assert!(text.contains("location/dc"));
                assert!(text.contains("snmp_agent/agent"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_core_update_aborts_remaining_stages() {
        let store = MemoryStore::new();
        store.seed("location", "dc", Attributes::new());
        store.seed("single_fw", "fw1", attrs(json!({"antivirus": false})));
        store.fail_mutations_of("single_fw", "fw1");

        let mut spec = spec();
        spec.tags = vec!["prod".to_string()];

        let err = converge(&store, &spec, PassOptions::default()).await.unwrap_err();
        match err {
            ConvergeError::Aborted { stage, applied, .. } => {
                assert_eq!(stage, "general");
                assert_eq!(applied.len(), 1);
                assert_eq!(applied.records()[0].action, Action::Failed);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Neither the location stage nor the tag stage ran.
        assert!(store.reference_of("category", "prod").is_none());
        assert_eq!(store.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_tags_create_missing_categories() {
        let store = MemoryStore::new();
        store.seed("single_fw", "fw1", Attributes::new());
        let existing = store.seed("category", "prod", Attributes::new());

        let spec = EngineSpec {
            name: "fw1".to_string(),
            tags: vec!["prod".to_string(), "emea".to_string()],
            ..EngineSpec::default()
        };
        let outcome = converge(&store, &spec, PassOptions::default()).await.unwrap();

        let created = store.reference_of("category", "emea").unwrap();
        let engine = store.attributes_of("single_fw", "fw1").unwrap();
        assert_eq!(engine["tags"], json!([existing.href, created.href]));
        assert!(outcome
            .state
            .iter()
            .any(|r| r.type_tag == "category" && r.action == Action::Created));
    }

    #[tokio::test]
    async fn test_dry_run_on_missing_engine_mutates_nothing() {
        let store = MemoryStore::new();
        store.seed("location", "dc", Attributes::new());
        let mut spec = spec();
        spec.interfaces = vec![InterfaceSpec {
            interface_id: "0".to_string(),
            nodes: vec![NodeAddress {
                address: "10.0.0.1".to_string(),
                network_value: "10.0.0.0/24".to_string(),
                nodeid: 1,
            }],
            ..InterfaceSpec::default()
        }];
        spec.tags = vec!["new".to_string()];

        let options = PassOptions {
            dry_run: true,
            ..PassOptions::default()
        };
        let outcome = converge(&store, &spec, options).await.unwrap();

        assert!(outcome.dry_run);
        assert!(outcome.changed);
        assert!(store.mutations().is_empty());
        assert!(outcome
            .state
            .iter()
            .any(|r| r.type_tag == "interface" && r.action == Action::Created));
        assert!(!store
            .journal()
            .iter()
            .any(|c| matches!(c, StoreCall::Children { .. })));
    }

    #[tokio::test]
    async fn test_record_unchanged_lists_every_stage() {
        let store = MemoryStore::new();
        let location = store.seed("location", "dc", Attributes::new());
        store.seed(
            "single_fw",
            "fw1",
            attrs(json!({"antivirus": true, "location_ref": location.href})),
        );

        let options = PassOptions {
            record_unchanged: true,
            match_options: MatchOptions::default(),
            ..PassOptions::default()
        };
        let outcome = converge(&store, &spec(), options).await.unwrap();
        assert!(!outcome.changed);
        let scopes: Vec<&str> = outcome
            .state
            .iter()
            .filter_map(|r| r.scope.as_deref())
            .collect();
        assert_eq!(scopes, vec!["general", "location"]);
    }
}
