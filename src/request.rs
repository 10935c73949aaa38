//! Change request entity and its lifecycle types.

use chrono::Utc;

use crate::error::WorkflowError;
use crate::record::{RecordKind, TimeStamp};
use crate::utils;

/// One field-level edit inside a change request. `old` is absent when the
/// field did not previously exist (new entity or previously unset field).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub old: Option<String>,
    #[n(2)]
    pub new: String,
}

/// `Pending` is the only live state; both resolutions are terminal and a
/// request is never resurrected.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

/// Origin of a request plus its source-specific metadata.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum RequestSource {
    #[n(0)]
    BulkImport {
        #[n(0)]
        uploader: String,
        #[n(1)]
        submitted_at: TimeStamp<Utc>,
    },
    #[n(1)]
    SingleField {
        #[n(0)]
        requester: String,
        #[n(1)]
        reason: String,
        #[n(2)]
        submitted_at: TimeStamp<Utc>,
    },
}

/// Payload-free discriminant of [`RequestSource`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    BulkImport,
    SingleField,
}

impl RequestSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::BulkImport { .. } => SourceKind::BulkImport,
            Self::SingleField { .. } => SourceKind::SingleField,
        }
    }

    pub fn submitted_at(&self) -> &TimeStamp<Utc> {
        match self {
            Self::BulkImport { submitted_at, .. } => submitted_at,
            Self::SingleField { submitted_at, .. } => submitted_at,
        }
    }
}

/// Resolver identity and timing, set exactly once when a request leaves
/// `Pending`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    #[n(0)]
    pub resolved_by: String,
    #[n(1)]
    pub resolved_at: TimeStamp<Utc>,
    #[n(2)]
    pub notes: Option<String>,
}

/// A staged, not-yet-committed proposal to create or modify a canonical
/// record. Kept forever for audit; only the resolution engine moves it out
/// of `Pending`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub entity_key: String,
    #[n(2)]
    pub record_kind: RecordKind,
    #[n(3)]
    pub is_new_entity: bool,
    #[n(4)]
    pub changes: Vec<FieldChange>,
    #[n(5)]
    pub status: RequestStatus,
    #[n(6)]
    pub source: RequestSource,
    #[n(7)]
    pub resolution: Option<Resolution>,
}

impl ChangeRequest {
    pub fn new(
        entity_key: String,
        record_kind: RecordKind,
        is_new_entity: bool,
        changes: Vec<FieldChange>,
        source: RequestSource,
    ) -> Result<Self, WorkflowError> {
        Ok(Self {
            id: utils::new_bech32_id("req")?,
            entity_key,
            record_kind,
            is_new_entity,
            changes,
            status: RequestStatus::Pending,
            source,
            resolution: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Content digest of the change set; identical re-imports carry the
    /// same digest and can be recognized without field-by-field comparison.
    pub fn changes_digest(&self) -> Result<String, WorkflowError> {
        let cbor = minicbor::to_vec(&self.changes).map_err(WorkflowError::codec)?;
        Ok(sha256::digest(&cbor))
    }
}
