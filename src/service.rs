//! Service layer API for the change-request reconciliation workflow.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::error::WorkflowError;
use crate::intake::{BatchSummary, BulkIntake};
use crate::record::{CandidateRecord, RecordKind, TimeStamp, canonical, field_spec, normalize};
use crate::request::{ChangeRequest, FieldChange, RequestSource, SourceKind};
use crate::resolution::{Decision, ResolutionEngine, ResolutionOutcome};
use crate::store::{CanonicalStore, ChangeRequestStore, MergePolicy};

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceConfig {
    pub merge_policy: MergePolicy,
}

/// Facade over the workflow's operation surface: bulk intake, pending
/// queries, single-field requests, and resolution. Transport is the
/// caller's concern.
pub struct ReconciliationService {
    store: ChangeRequestStore,
    canonical: CanonicalStore,
    engine: ResolutionEngine,
    audit: AuditLog,
}

impl ReconciliationService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, WorkflowError> {
        Self::with_config(instance, ServiceConfig::default())
    }

    pub fn with_config(
        instance: Arc<sled::Db>,
        config: ServiceConfig,
    ) -> Result<Self, WorkflowError> {
        let store = ChangeRequestStore::open(&instance, config.merge_policy)?;
        let canonical = CanonicalStore::open(&instance)?;
        let audit = AuditLog::open(&instance)?;
        let engine = ResolutionEngine::new(&store, &canonical, audit.clone());

        Ok(Self {
            store,
            canonical,
            engine,
            audit,
        })
    }

    /// Stage a batch of candidate rows from the bulk ingestion source.
    pub fn ingest_batch(
        &self,
        candidates: &[CandidateRecord],
        uploader: &str,
        kind: RecordKind,
    ) -> Result<BatchSummary, WorkflowError> {
        BulkIntake::new(&self.store, &self.canonical).ingest(candidates, uploader, kind)
    }

    pub fn list_pending(
        &self,
        filter: Option<SourceKind>,
    ) -> Result<Vec<ChangeRequest>, WorkflowError> {
        self.store.list_pending(filter)
    }

    pub fn get_request(&self, id: &str) -> Result<ChangeRequest, WorkflowError> {
        self.store.get(id)
    }

    /// Stage a one-field transition (for example status enable/disable)
    /// with a mandatory reason and requester identity. Flows through the
    /// same store and resolution engine as bulk-derived requests.
    pub fn request_field_change(
        &self,
        entity_key: &str,
        field_name: &str,
        new_value: &str,
        reason: &str,
        requester: &str,
    ) -> Result<ChangeRequest, WorkflowError> {
        if requester.trim().is_empty() {
            return Err(WorkflowError::Validation("requester identity is required".into()));
        }
        if reason.trim().is_empty() {
            return Err(WorkflowError::Validation("a reason is required".into()));
        }
        if new_value.trim().is_empty() {
            return Err(WorkflowError::Validation("new value is blank".into()));
        }

        let spec = field_spec(field_name).ok_or_else(|| {
            WorkflowError::Validation(format!("unknown field name: {field_name}"))
        })?;
        if spec.is_key {
            return Err(WorkflowError::Validation("the entity key cannot be changed".into()));
        }

        let live = self.canonical.find_by_key(entity_key)?.ok_or_else(|| {
            WorkflowError::NotFound(format!("no canonical record for entity {entity_key}"))
        })?;

        let proposed = normalize(spec.kind, new_value);
        if live.normalized_field(spec).as_deref() == Some(proposed.as_str()) {
            return Err(WorkflowError::Conflict(format!(
                "field {} of entity {entity_key} already has that value",
                spec.name
            )));
        }

        let change = FieldChange {
            field: spec.name.to_string(),
            old: live.field(spec.name).map(str::to_string),
            new: canonical(spec.kind, new_value),
        };
        let source = RequestSource::SingleField {
            requester: requester.trim().to_string(),
            reason: reason.trim().to_string(),
            submitted_at: TimeStamp::now(),
        };

        let staged =
            self.store
                .upsert_pending(entity_key, live.kind, vec![change], false, source)?;
        Ok(staged.request)
    }

    pub fn resolve_one(
        &self,
        request_id: &str,
        decision: Decision,
        resolver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest, WorkflowError> {
        self.engine.resolve_one(request_id, decision, resolver, notes)
    }

    pub fn resolve_for_key(
        &self,
        entity_key: &str,
        decision: Decision,
        resolver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest, WorkflowError> {
        self.engine.resolve_for_key(entity_key, decision, resolver, notes)
    }

    pub fn resolve_all_pending(
        &self,
        filter: Option<SourceKind>,
        decision: Decision,
        resolver: &str,
    ) -> Result<Vec<ResolutionOutcome>, WorkflowError> {
        self.engine.resolve_all_pending(filter, decision, resolver)
    }

    /// Canonical record store handle, for seeding and reads by the
    /// surrounding application.
    pub fn canonical(&self) -> &CanonicalStore {
        &self.canonical
    }

    /// Read access to the resolution audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
