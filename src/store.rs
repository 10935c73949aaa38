//! Durable stores: the change-request store (single source of truth for
//! pending work) and the canonical record store it reconciles against.
//!
//! Both sit on named sled trees inside one `Db`. The `pending` tree maps an
//! entity key to its open request id and is the uniqueness constraint that
//! makes two simultaneous pending requests for one key impossible; every
//! mutation of it happens inside a sled transaction, so concurrent writers
//! for the same key serialize (losers retry internally).

use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::error::WorkflowError;
use crate::record::{CanonicalRecord, RecordKind};
use crate::request::{ChangeRequest, FieldChange, RequestSource, SourceKind};

/// What to do when a new submission targets a key that already has a
/// pending request. The observed upstream behavior is ambiguous, so this is
/// configuration rather than a hard-coded rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Overwrite the pending request's changes and metadata in place,
    /// keeping its id. A later re-import supersedes an earlier one.
    #[default]
    ReplaceLatest,
    /// Refuse with `Conflict`; the caller must resolve the open request
    /// first.
    RejectConflict,
}

/// Result of staging: the request, and whether it was actually persisted.
/// A no-op change set against an existing entity is returned unpersisted.
#[derive(Debug, Clone)]
pub struct StagedRequest {
    pub request: ChangeRequest,
    pub persisted: bool,
}

pub struct ChangeRequestStore {
    pub(crate) requests: sled::Tree,
    pub(crate) pending: sled::Tree,
    policy: MergePolicy,
}

impl ChangeRequestStore {
    pub fn open(db: &sled::Db, policy: MergePolicy) -> Result<Self, WorkflowError> {
        Ok(Self {
            requests: db.open_tree("requests")?,
            pending: db.open_tree("pending")?,
            policy,
        })
    }

    /// Stage a change set for an entity key, creating a pending request or
    /// merging into the existing one per the configured policy.
    ///
    /// An empty change set against an existing entity is a genuine no-op:
    /// the would-be request is returned without touching the store.
    pub fn upsert_pending(
        &self,
        entity_key: &str,
        record_kind: RecordKind,
        changes: Vec<FieldChange>,
        is_new_entity: bool,
        source: RequestSource,
    ) -> Result<StagedRequest, WorkflowError> {
        if entity_key.trim().is_empty() {
            return Err(WorkflowError::Validation("entity key is blank".into()));
        }

        let fresh = ChangeRequest::new(
            entity_key.to_string(),
            record_kind,
            is_new_entity,
            changes,
            source,
        )?;

        if fresh.changes.is_empty() && !is_new_entity {
            return Ok(StagedRequest {
                request: fresh,
                persisted: false,
            });
        }

        let fresh_digest = fresh.changes_digest()?;
        let policy = self.policy;

        let staged = unwrap_txn((&self.requests, &self.pending).transaction(|(requests, pending)| {
            let Some(open_id) = pending.get(entity_key.as_bytes())? else {
                requests.insert(fresh.id.as_bytes(), encode_request(&fresh).map_err(abort)?)?;
                pending.insert(entity_key.as_bytes(), fresh.id.as_bytes())?;
                return Ok(fresh.clone());
            };

            if policy == MergePolicy::RejectConflict {
                return Err(abort(WorkflowError::Conflict(format!(
                    "a pending request already exists for entity {entity_key}"
                ))));
            }

            let stored = requests.get(&open_id)?.ok_or_else(|| {
                abort(WorkflowError::Codec(format!(
                    "pending index points at missing request for entity {entity_key}"
                )))
            })?;
            let existing = decode_request(&stored).map_err(abort)?;

            // Byte-identical re-import: keep the original submission as is.
            if existing.changes_digest().map_err(abort)? == fresh_digest {
                return Ok(existing);
            }

            let merged = ChangeRequest {
                id: existing.id,
                ..fresh.clone()
            };
            requests.insert(merged.id.as_bytes(), encode_request(&merged).map_err(abort)?)?;
            Ok(merged)
        }))?;

        Ok(StagedRequest {
            request: staged,
            persisted: true,
        })
    }

    /// All pending requests, optionally narrowed to one source kind.
    pub fn list_pending(
        &self,
        filter: Option<SourceKind>,
    ) -> Result<Vec<ChangeRequest>, WorkflowError> {
        let mut result = Vec::new();
        for entry in self.pending.iter() {
            let (_, id) = entry?;
            let Some(bytes) = self.requests.get(&id)? else {
                continue;
            };
            let request = decode_request(&bytes)?;
            if filter.is_none_or(|kind| request.source.kind() == kind) {
                result.push(request);
            }
        }
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Result<ChangeRequest, WorkflowError> {
        let bytes = self
            .requests
            .get(id.as_bytes())?
            .ok_or_else(|| WorkflowError::NotFound(format!("request {id}")))?;
        decode_request(&bytes)
    }

    /// Id of the open request for an entity key, if any.
    pub fn pending_id_for(&self, entity_key: &str) -> Result<Option<String>, WorkflowError> {
        match self.pending.get(entity_key.as_bytes())? {
            Some(id) => Ok(Some(
                String::from_utf8(id.to_vec())
                    .map_err(|_| WorkflowError::Codec("pending index id is not utf-8".into()))?,
            )),
            None => Ok(None),
        }
    }
}

/// Read/update handle over the authoritative entity records. The workflow
/// mutates them only through the atomic apply inside resolution; `put` is
/// the seeding path for the surrounding application.
pub struct CanonicalStore {
    pub(crate) tree: sled::Tree,
}

impl CanonicalStore {
    pub fn open(db: &sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            tree: db.open_tree("canonical")?,
        })
    }

    /// Capability-polymorphic lookup: the returned record carries its own
    /// kind (employee or rider).
    pub fn find_by_key(&self, entity_key: &str) -> Result<Option<CanonicalRecord>, WorkflowError> {
        match self.tree.get(entity_key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &CanonicalRecord) -> Result<(), WorkflowError> {
        self.tree
            .insert(record.entity_key.as_bytes(), encode_record(record)?)?;
        Ok(())
    }
}

pub(crate) fn encode_request(request: &ChangeRequest) -> Result<Vec<u8>, WorkflowError> {
    minicbor::to_vec(request).map_err(WorkflowError::codec)
}

pub(crate) fn decode_request(bytes: &[u8]) -> Result<ChangeRequest, WorkflowError> {
    minicbor::decode(bytes).map_err(WorkflowError::codec)
}

pub(crate) fn encode_record(record: &CanonicalRecord) -> Result<Vec<u8>, WorkflowError> {
    minicbor::to_vec(record).map_err(WorkflowError::codec)
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<CanonicalRecord, WorkflowError> {
    minicbor::decode(bytes).map_err(WorkflowError::codec)
}

pub(crate) fn abort(err: WorkflowError) -> ConflictableTransactionError<WorkflowError> {
    ConflictableTransactionError::Abort(err)
}

pub(crate) fn unwrap_txn<T>(
    result: Result<T, TransactionError<WorkflowError>>,
) -> Result<T, WorkflowError> {
    result.map_err(|err| match err {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => WorkflowError::StoreUnavailable(inner),
    })
}
