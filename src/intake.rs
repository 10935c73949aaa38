//! Bulk intake coordinator: turns a batch of candidate rows into staged
//! change requests and a per-row classification summary.

use log::{debug, warn};

use crate::differ::diff;
use crate::error::WorkflowError;
use crate::record::{CandidateRecord, RecordKind, TimeStamp};
use crate::request::RequestSource;
use crate::store::{CanonicalStore, ChangeRequestStore};

/// Exactly one of the four classifications applies to every input row.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub total_rows: usize,
    pub new_entities: usize,
    pub updated_entities: usize,
    pub unchanged_skipped: usize,
    pub invalid_rows: usize,
}

pub struct BulkIntake<'a> {
    store: &'a ChangeRequestStore,
    canonical: &'a CanonicalStore,
}

impl<'a> BulkIntake<'a> {
    pub fn new(store: &'a ChangeRequestStore, canonical: &'a CanonicalStore) -> Self {
        Self { store, canonical }
    }

    /// Ingest a batch. Row-level problems (missing key, merge conflict)
    /// classify the row and move on; only an invalid envelope or an
    /// unavailable store fails the call. Rows staged before such a failure
    /// stay staged, each row's atomicity unit being already closed.
    pub fn ingest(
        &self,
        candidates: &[CandidateRecord],
        uploader: &str,
        kind: RecordKind,
    ) -> Result<BatchSummary, WorkflowError> {
        if uploader.trim().is_empty() {
            return Err(WorkflowError::Validation("uploader identity is required".into()));
        }
        if candidates.is_empty() {
            return Err(WorkflowError::Validation("batch contains no rows".into()));
        }

        let submitted_at = TimeStamp::now();
        let mut summary = BatchSummary {
            total_rows: candidates.len(),
            ..BatchSummary::default()
        };

        for candidate in candidates {
            let entity_key = match candidate.entity_key() {
                Ok(key) => key,
                Err(err) => {
                    debug!("skipping row without usable entity key: {err}");
                    summary.invalid_rows += 1;
                    continue;
                }
            };

            let live = self.canonical.find_by_key(&entity_key)?;
            let changes = diff(candidate, live.as_ref());

            if changes.is_empty() && live.is_some() {
                summary.unchanged_skipped += 1;
                continue;
            }

            let is_new_entity = live.is_none();
            let record_kind = live.as_ref().map(|record| record.kind).unwrap_or(kind);
            let source = RequestSource::BulkImport {
                uploader: uploader.to_string(),
                submitted_at: submitted_at.clone(),
            };

            match self
                .store
                .upsert_pending(&entity_key, record_kind, changes, is_new_entity, source)
            {
                Ok(_) => {
                    if is_new_entity {
                        summary.new_entities += 1;
                    } else {
                        summary.updated_entities += 1;
                    }
                }
                Err(WorkflowError::Conflict(reason)) => {
                    warn!("row for entity {entity_key} not staged: {reason}");
                    summary.invalid_rows += 1;
                }
                Err(other) => return Err(other),
            }
        }

        Ok(summary)
    }
}
