//! Append-only audit log for resolution events.
//!
//! The log sits outside the approval atomicity boundary: a failed append is
//! logged and swallowed, never rolled back into the commit.

use chrono::Utc;

use crate::error::WorkflowError;
use crate::record::TimeStamp;
use crate::request::FieldChange;
use crate::resolution::Decision;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    #[n(0)]
    pub entity_key: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub decision: Decision,
    #[n(3)]
    pub changes: Vec<FieldChange>,
    #[n(4)]
    pub changes_digest: String,
    #[n(5)]
    pub resolver: String,
    #[n(6)]
    pub occurred_at: TimeStamp<Utc>,
}

/// sled-backed event log keyed by `(entity key, timestamp, request id)`.
#[derive(Clone)]
pub struct AuditLog {
    tree: sled::Tree,
}

impl AuditLog {
    pub fn open(db: &sled::Db) -> Result<Self, WorkflowError> {
        Ok(Self {
            tree: db.open_tree("audit")?,
        })
    }

    pub fn append(&self, event: &AuditEvent) -> Result<(), WorkflowError> {
        let mut key = Vec::with_capacity(event.entity_key.len() + 9 + event.request_id.len());
        key.extend_from_slice(event.entity_key.as_bytes());
        key.push(0);
        key.extend_from_slice(&event.occurred_at.millis().to_be_bytes());
        key.extend_from_slice(event.request_id.as_bytes());

        let value = minicbor::to_vec(event).map_err(WorkflowError::codec)?;
        self.tree.insert(key, value)?;
        Ok(())
    }

    /// Events for one entity, oldest first.
    pub fn events_for(&self, entity_key: &str) -> Result<Vec<AuditEvent>, WorkflowError> {
        let mut prefix = Vec::with_capacity(entity_key.len() + 1);
        prefix.extend_from_slice(entity_key.as_bytes());
        prefix.push(0);

        let mut events = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (_, value) = entry?;
            events.push(minicbor::decode(&value).map_err(WorkflowError::codec)?);
        }
        Ok(events)
    }
}
