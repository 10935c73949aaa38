//! Resolution engine: applies operator decisions to pending requests.
//!
//! An approval re-fetches the live canonical record, applies the staged
//! changes, and flips the request to `Approved` inside one sled transaction
//! over the `requests`, `pending` and `canonical` trees. Either all of that
//! happens or none of it does; the audit append runs after the commit and
//! never rolls it back.

use log::warn;

use crate::audit::{AuditEvent, AuditLog};
use crate::error::WorkflowError;
use crate::record::{CanonicalRecord, TimeStamp, field_spec, normalize};
use crate::request::{ChangeRequest, RequestStatus, Resolution, SourceKind};
use crate::store::{
    CanonicalStore, ChangeRequestStore, abort, decode_record, decode_request, encode_record,
    encode_request, unwrap_txn,
};

use sled::Transactional;

/// The operator decision that terminates a request's pending state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    #[n(0)]
    Approved,
    #[n(1)]
    Rejected,
}

/// Per-request outcome of a bulk resolution. A failed member never aborts
/// its siblings, so partial success is visible here.
#[derive(Debug)]
pub struct ResolutionOutcome {
    pub request_id: String,
    pub entity_key: String,
    pub result: Result<ChangeRequest, WorkflowError>,
}

pub struct ResolutionEngine {
    requests: sled::Tree,
    pending: sled::Tree,
    canonical: sled::Tree,
    audit: AuditLog,
}

impl ResolutionEngine {
    pub fn new(store: &ChangeRequestStore, canonical: &CanonicalStore, audit: AuditLog) -> Self {
        Self {
            requests: store.requests.clone(),
            pending: store.pending.clone(),
            canonical: canonical.tree.clone(),
            audit,
        }
    }

    /// Resolve one request by id. Re-resolving an already-terminal request
    /// returns `InvalidState` and leaves everything untouched, which is what
    /// makes duplicate resolve calls harmless.
    pub fn resolve_one(
        &self,
        request_id: &str,
        decision: Decision,
        resolver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest, WorkflowError> {
        if resolver.trim().is_empty() {
            return Err(WorkflowError::Validation("resolver identity is required".into()));
        }

        let resolved = unwrap_txn(
            (&self.requests, &self.pending, &self.canonical).transaction(
                |(requests, pending, canonical)| {
                    let bytes = requests.get(request_id.as_bytes())?.ok_or_else(|| {
                        abort(WorkflowError::NotFound(format!("request {request_id}")))
                    })?;
                    let mut request = decode_request(&bytes).map_err(abort)?;

                    if !request.is_pending() {
                        return Err(abort(WorkflowError::InvalidState {
                            request_id: request.id,
                            status: request.status,
                        }));
                    }

                    if decision == Decision::Approved {
                        let live = canonical
                            .get(request.entity_key.as_bytes())?
                            .map(|bytes| decode_record(&bytes))
                            .transpose()
                            .map_err(abort)?;
                        let updated = apply_changes(&request, live.as_ref()).map_err(abort)?;
                        canonical.insert(
                            request.entity_key.as_bytes(),
                            encode_record(&updated).map_err(abort)?,
                        )?;
                    }

                    request.status = match decision {
                        Decision::Approved => RequestStatus::Approved,
                        Decision::Rejected => RequestStatus::Rejected,
                    };
                    request.resolution = Some(Resolution {
                        resolved_by: resolver.to_string(),
                        resolved_at: TimeStamp::now(),
                        notes: notes.map(str::to_string),
                    });

                    requests.insert(request.id.as_bytes(), encode_request(&request).map_err(abort)?)?;
                    pending.remove(request.entity_key.as_bytes())?;
                    Ok(request)
                },
            ),
        )?;

        self.emit_audit(&resolved, decision, resolver);
        Ok(resolved)
    }

    /// Resolve whatever request is open for an entity key.
    pub fn resolve_for_key(
        &self,
        entity_key: &str,
        decision: Decision,
        resolver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest, WorkflowError> {
        let id = self.pending.get(entity_key.as_bytes())?.ok_or_else(|| {
            WorkflowError::NotFound(format!("no pending request for entity {entity_key}"))
        })?;
        let id = String::from_utf8(id.to_vec())
            .map_err(|_| WorkflowError::Codec("pending index id is not utf-8".into()))?;
        self.resolve_one(&id, decision, resolver, notes)
    }

    /// Resolve every pending request (optionally of one source kind). The
    /// pending set is snapshotted first; each member then resolves in its
    /// own atomicity unit, so one stale-record conflict leaves the rest
    /// unaffected.
    pub fn resolve_all_pending(
        &self,
        filter: Option<SourceKind>,
        decision: Decision,
        resolver: &str,
    ) -> Result<Vec<ResolutionOutcome>, WorkflowError> {
        if resolver.trim().is_empty() {
            return Err(WorkflowError::Validation("resolver identity is required".into()));
        }

        let mut snapshot = Vec::new();
        for entry in self.pending.iter() {
            let (key, id) = entry?;
            let Some(bytes) = self.requests.get(&id)? else {
                continue;
            };
            let request = decode_request(&bytes)?;
            if filter.is_none_or(|kind| request.source.kind() == kind) {
                let entity_key = String::from_utf8(key.to_vec())
                    .map_err(|_| WorkflowError::Codec("pending index key is not utf-8".into()))?;
                snapshot.push((request.id, entity_key));
            }
        }

        let mut outcomes = Vec::with_capacity(snapshot.len());
        for (request_id, entity_key) in snapshot {
            let result = self.resolve_one(&request_id, decision, resolver, None);
            outcomes.push(ResolutionOutcome {
                request_id,
                entity_key,
                result,
            });
        }
        Ok(outcomes)
    }

    // Best-effort: the commit already happened, a sink failure only loses
    // the notification.
    fn emit_audit(&self, resolved: &ChangeRequest, decision: Decision, resolver: &str) {
        let digest = match resolved.changes_digest() {
            Ok(digest) => digest,
            Err(err) => {
                warn!("audit digest for request {} failed: {err}", resolved.id);
                return;
            }
        };
        let event = AuditEvent {
            entity_key: resolved.entity_key.clone(),
            request_id: resolved.id.clone(),
            decision,
            changes: resolved.changes.clone(),
            changes_digest: digest,
            resolver: resolver.to_string(),
            occurred_at: TimeStamp::now(),
        };
        if let Err(err) = self.audit.append(&event) {
            warn!(
                "audit append for entity {} (request {}) failed: {err}",
                resolved.entity_key, resolved.id
            );
        }
    }
}

/// Apply a request's changes against the live record, guarding against the
/// record having drifted since staging. Any drift is a `Conflict` the
/// operator must re-review; nothing is written when it fires.
fn apply_changes(
    request: &ChangeRequest,
    live: Option<&CanonicalRecord>,
) -> Result<CanonicalRecord, WorkflowError> {
    let mut record = match (request.is_new_entity, live) {
        (true, Some(_)) => {
            return Err(WorkflowError::Conflict(format!(
                "a canonical record appeared for entity {} since staging",
                request.entity_key
            )));
        }
        (false, None) => {
            return Err(WorkflowError::Conflict(format!(
                "the canonical record for entity {} disappeared since staging",
                request.entity_key
            )));
        }
        (true, None) => CanonicalRecord::new(request.entity_key.clone(), request.record_kind),
        (false, Some(existing)) => existing.clone(),
    };

    for change in &request.changes {
        if let Some(spec) = field_spec(&change.field) {
            let current = record.normalized_field(spec);
            let staged_old = change.old.as_deref().map(|old| normalize(spec.kind, old));
            if current != staged_old {
                return Err(WorkflowError::Conflict(format!(
                    "field {} of entity {} changed since staging",
                    change.field, request.entity_key
                )));
            }
        }
        record = record.set_field(&change.field, &change.new);
    }

    Ok(record)
}
