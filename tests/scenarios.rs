//! End-to-end workflow scenarios against a real sled database.
//!
//! Sled uses file-based locking to prevent concurrent access, so each test
//! opens its own database under a tempdir; dropping the tempdir cleans up.

use std::sync::Arc;

use anyhow::Context;
use tempfile::TempDir;

use change_reconciliation::{
    error::WorkflowError,
    record::{CandidateRecord, CanonicalRecord, RecordKind},
    request::{RequestStatus, SourceKind},
    resolution::Decision,
    service::{ReconciliationService, ServiceConfig},
    store::MergePolicy,
    utils,
};

fn open_service(temp: &TempDir, name: &str) -> anyhow::Result<ReconciliationService> {
    let db = sled::open(temp.path().join(name))?;
    Ok(ReconciliationService::new(Arc::new(db))?)
}

fn open_service_with(
    temp: &TempDir,
    name: &str,
    config: ServiceConfig,
) -> anyhow::Result<ReconciliationService> {
    let db = sled::open(temp.path().join(name))?;
    Ok(ReconciliationService::with_config(Arc::new(db), config)?)
}

#[test]
fn ingest_new_entity_and_approve() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "ingest_new.db")?;

    let candidate = CandidateRecord::new()
        .with("Residency ID", "1001")
        .with("Name AR", "أحمد");

    let summary = service
        .ingest_batch(&[candidate], "uploader_a", RecordKind::Employee)
        .context("batch failed on ingest")?;

    assert_eq!(summary.total_rows, 1);
    assert_eq!(summary.new_entities, 1);
    assert_eq!(summary.updated_entities, 0);
    assert_eq!(summary.unchanged_skipped, 0);
    assert_eq!(summary.invalid_rows, 0);

    let pending = service.list_pending(None)?;
    assert_eq!(pending.len(), 1);
    let request = &pending[0];
    assert!(request.is_new_entity);
    assert_eq!(request.entity_key, "1001");
    assert_eq!(request.changes.len(), 1);
    assert_eq!(request.changes[0].field, "name_ar");
    assert_eq!(request.changes[0].old, None);
    assert_eq!(request.changes[0].new, "أحمد");

    let resolver = utils::new_bech32_id("user")?;
    let resolved = service
        .resolve_one(&request.id, Decision::Approved, &resolver, None)
        .context("request failed on approval")?;
    assert_eq!(resolved.status, RequestStatus::Approved);

    let record = service
        .canonical()
        .find_by_key("1001")?
        .context("canonical record was not created")?;
    assert_eq!(record.kind, RecordKind::Employee);
    assert_eq!(record.field("name_ar"), Some("أحمد"));

    assert!(service.list_pending(None)?.is_empty());

    let events = service.audit().events_for("1001")?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Approved);
    assert_eq!(events[0].resolver, resolver);
    Ok(())
}

#[test]
fn ingest_update_existing_and_approve() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "ingest_update.db")?;

    service.canonical().put(
        &CanonicalRecord::new("2002", RecordKind::Rider)
            .set_field("name_en", "Ahmed Ali")
            .set_field("status", "disable"),
    )?;

    let candidate = CandidateRecord::new()
        .with("residency_id", "2002")
        .with("Name EN", "Ahmed Ali")
        .with("Status", "enable");

    let summary = service.ingest_batch(&[candidate], "uploader_a", RecordKind::Rider)?;
    assert_eq!(summary.updated_entities, 1);
    assert_eq!(summary.new_entities, 0);

    let pending = service.list_pending(None)?;
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].is_new_entity);
    assert_eq!(pending[0].changes.len(), 1);
    assert_eq!(pending[0].changes[0].field, "status");
    assert_eq!(pending[0].changes[0].old.as_deref(), Some("disable"));

    let resolver = utils::new_bech32_id("user")?;
    service.resolve_for_key("2002", Decision::Approved, &resolver, Some("verified"))?;

    let record = service.canonical().find_by_key("2002")?.unwrap();
    assert_eq!(record.field("status"), Some("enable"));
    assert_eq!(record.field("name_en"), Some("Ahmed Ali"));
    Ok(())
}

#[test]
fn unchanged_rows_are_skipped_without_staging() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "unchanged.db")?;

    service.canonical().put(
        &CanonicalRecord::new("3003", RecordKind::Employee).set_field("name_en", "Sara"),
    )?;

    let candidate = CandidateRecord::new()
        .with("residency_id", "3003")
        .with("name_en", "  Sara ");

    let summary = service.ingest_batch(&[candidate], "uploader_a", RecordKind::Employee)?;
    assert_eq!(summary.unchanged_skipped, 1);
    assert_eq!(summary.new_entities + summary.updated_entities, 0);
    assert!(service.list_pending(None)?.is_empty());
    Ok(())
}

#[test]
fn invalid_rows_never_abort_the_batch() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "invalid_rows.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("4004", RecordKind::Employee).set_field("status", "enable"))?;

    let missing_key = CandidateRecord::new().with("Name EN", "Nobody");
    let blank_key = CandidateRecord::new().with("Residency ID", "   ");
    let fresh = CandidateRecord::new()
        .with("Residency ID", "4005")
        .with("Name EN", "Omar");
    let unchanged = CandidateRecord::new()
        .with("Residency ID", "4004")
        .with("Status", "ENABLE");

    let summary = service.ingest_batch(
        &[missing_key, blank_key, fresh, unchanged],
        "uploader_a",
        RecordKind::Employee,
    )?;

    assert_eq!(summary.total_rows, 4);
    assert_eq!(summary.invalid_rows, 2);
    assert_eq!(summary.new_entities, 1);
    assert_eq!(summary.unchanged_skipped, 1);
    Ok(())
}

#[test]
fn empty_batch_fails_on_the_envelope() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "empty_batch.db")?;

    let result = service.ingest_batch(&[], "uploader_a", RecordKind::Employee);
    assert!(matches!(result, Err(WorkflowError::Validation(_))));
    Ok(())
}

#[test]
fn reimport_replaces_the_pending_request_without_duplicates() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "reimport.db")?;

    let first = CandidateRecord::new()
        .with("Residency ID", "5005")
        .with("Name EN", "Omar");
    service.ingest_batch(&[first], "uploader_a", RecordKind::Employee)?;

    let original_id = service.list_pending(None)?[0].id.clone();

    let second = CandidateRecord::new()
        .with("Residency ID", "5005")
        .with("Name EN", "Omar Khalid");
    service.ingest_batch(&[second], "uploader_b", RecordKind::Employee)?;

    let pending = service.list_pending(None)?;
    assert_eq!(pending.len(), 1, "one key never holds two pending requests");
    assert_eq!(pending[0].id, original_id, "replacement keeps the identity");
    assert_eq!(pending[0].changes[0].new, "Omar Khalid");
    Ok(())
}

#[test]
fn reject_conflict_policy_refuses_a_second_submission() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service_with(
        &temp,
        "reject_policy.db",
        ServiceConfig {
            merge_policy: MergePolicy::RejectConflict,
        },
    )?;

    let first = CandidateRecord::new()
        .with("Residency ID", "6006")
        .with("Name EN", "Huda");
    service.ingest_batch(&[first], "uploader_a", RecordKind::Employee)?;

    let second = CandidateRecord::new()
        .with("Residency ID", "6006")
        .with("Name EN", "Huda S");
    let summary = service.ingest_batch(&[second], "uploader_a", RecordKind::Employee)?;

    // The conflicting row is classified, not fatal, and the original
    // submission stays staged untouched.
    assert_eq!(summary.invalid_rows, 1);
    let pending = service.list_pending(None)?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].changes[0].new, "Huda");
    Ok(())
}

#[test]
fn single_field_request_full_lifecycle() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "single_field.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("7007", RecordKind::Rider).set_field("status", "disable"))?;

    let request = service
        .request_field_change("7007", "status", "enable", "medical clearance", "supervisorA")
        .context("single-field request failed")?;

    assert_eq!(request.source.kind(), SourceKind::SingleField);
    assert_eq!(request.changes.len(), 1);
    assert_eq!(request.changes[0].old.as_deref(), Some("disable"));
    assert_eq!(request.changes[0].new, "enable");

    let resolver = utils::new_bech32_id("user")?;
    service.resolve_one(&request.id, Decision::Approved, &resolver, None)?;

    let record = service.canonical().find_by_key("7007")?.unwrap();
    assert_eq!(record.field("status"), Some("enable"));

    // The transition is now a no-op, mirroring the "already active" check.
    let again = service.request_field_change("7007", "status", "enable", "retry", "supervisorA");
    assert!(matches!(again, Err(WorkflowError::Conflict(_))));
    Ok(())
}

#[test]
fn single_field_request_validation() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "single_field_validation.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("8008", RecordKind::Employee).set_field("status", "enable"))?;

    let no_reason = service.request_field_change("8008", "status", "disable", "  ", "supervisorA");
    assert!(matches!(no_reason, Err(WorkflowError::Validation(_))));

    let no_requester = service.request_field_change("8008", "status", "disable", "left", "");
    assert!(matches!(no_requester, Err(WorkflowError::Validation(_))));

    let unknown_field = service.request_field_change("8008", "shoe_size", "44", "reason", "supervisorA");
    assert!(matches!(unknown_field, Err(WorkflowError::Validation(_))));

    let missing_record = service.request_field_change("9999", "status", "disable", "left", "supervisorA");
    assert!(matches!(missing_record, Err(WorkflowError::NotFound(_))));
    Ok(())
}

#[test]
fn rejection_leaves_the_canonical_record_untouched() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "rejection.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("1101", RecordKind::Employee).set_field("status", "enable"))?;

    let request =
        service.request_field_change("1101", "status", "disable", "resigned", "supervisorB")?;

    let resolver = utils::new_bech32_id("user")?;
    let resolved = service.resolve_one(&request.id, Decision::Rejected, &resolver, Some("paperwork missing"))?;

    assert_eq!(resolved.status, RequestStatus::Rejected);
    let resolution = resolved.resolution.context("resolution fields not set")?;
    assert_eq!(resolution.resolved_by, resolver);
    assert_eq!(resolution.notes.as_deref(), Some("paperwork missing"));

    let record = service.canonical().find_by_key("1101")?.unwrap();
    assert_eq!(record.field("status"), Some("enable"));

    let events = service.audit().events_for("1101")?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Rejected);
    Ok(())
}

#[test]
fn resolving_twice_returns_invalid_state() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "double_resolve.db")?;

    let candidate = CandidateRecord::new()
        .with("Residency ID", "1201")
        .with("Name EN", "Lina");
    service.ingest_batch(&[candidate], "uploader_a", RecordKind::Employee)?;
    let request_id = service.list_pending(None)?[0].id.clone();

    let resolver = utils::new_bech32_id("user")?;
    service.resolve_one(&request_id, Decision::Approved, &resolver, None)?;

    let before = service.canonical().find_by_key("1201")?.unwrap();

    // Simulated duplicate bulk-resolve call: second attempt must not
    // re-apply anything.
    let again = service.resolve_one(&request_id, Decision::Approved, &resolver, None);
    assert!(matches!(again, Err(WorkflowError::InvalidState { .. })));

    let reject_late = service.resolve_one(&request_id, Decision::Rejected, &resolver, None);
    assert!(matches!(reject_late, Err(WorkflowError::InvalidState { .. })));

    let after = service.canonical().find_by_key("1201")?.unwrap();
    assert_eq!(before, after, "exactly one mutation ever reaches the record");
    Ok(())
}

#[test]
fn stale_canonical_record_keeps_the_request_pending() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "stale.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("1301", RecordKind::Employee).set_field("status", "disable"))?;

    let request =
        service.request_field_change("1301", "status", "enable", "clearance", "supervisorA")?;

    // The record changes between staging and resolution.
    service
        .canonical()
        .put(&CanonicalRecord::new("1301", RecordKind::Employee).set_field("status", "suspended"))?;

    let resolver = utils::new_bech32_id("user")?;
    let result = service.resolve_one(&request.id, Decision::Approved, &resolver, None);
    assert!(matches!(result, Err(WorkflowError::Conflict(_))));

    // The approval aborted atomically: still pending, record untouched.
    let reloaded = service.get_request(&request.id)?;
    assert_eq!(reloaded.status, RequestStatus::Pending);
    assert_eq!(service.list_pending(None)?.len(), 1);
    let record = service.canonical().find_by_key("1301")?.unwrap();
    assert_eq!(record.field("status"), Some("suspended"));
    assert!(service.audit().events_for("1301")?.is_empty());
    Ok(())
}

#[test]
fn bulk_resolution_reports_partial_success() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "bulk_resolution.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("1401", RecordKind::Employee).set_field("status", "disable"))?;
    service
        .canonical()
        .put(&CanonicalRecord::new("1402", RecordKind::Employee).set_field("status", "disable"))?;

    service.request_field_change("1401", "status", "enable", "cleared", "supervisorA")?;
    service.request_field_change("1402", "status", "enable", "cleared", "supervisorA")?;

    // One record drifts before resolution.
    service
        .canonical()
        .put(&CanonicalRecord::new("1402", RecordKind::Employee).set_field("status", "suspended"))?;

    let resolver = utils::new_bech32_id("user")?;
    let outcomes = service.resolve_all_pending(None, Decision::Approved, &resolver)?;
    assert_eq!(outcomes.len(), 2);

    let ok = outcomes.iter().find(|o| o.entity_key == "1401").unwrap();
    assert!(ok.result.is_ok());
    let stale = outcomes.iter().find(|o| o.entity_key == "1402").unwrap();
    assert!(matches!(stale.result, Err(WorkflowError::Conflict(_))));

    assert_eq!(
        service.canonical().find_by_key("1401")?.unwrap().field("status"),
        Some("enable")
    );
    // The failed member survives for manual re-review.
    assert_eq!(service.list_pending(None)?.len(), 1);
    assert_eq!(service.list_pending(None)?[0].entity_key, "1402");
    Ok(())
}

#[test]
fn source_filter_narrows_bulk_resolution() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let service = open_service(&temp, "source_filter.db")?;

    service
        .canonical()
        .put(&CanonicalRecord::new("1501", RecordKind::Employee).set_field("status", "disable"))?;

    let imported = CandidateRecord::new()
        .with("Residency ID", "1502")
        .with("Name EN", "Faris");
    service.ingest_batch(&[imported], "uploader_a", RecordKind::Employee)?;
    service.request_field_change("1501", "status", "enable", "cleared", "supervisorA")?;

    assert_eq!(service.list_pending(None)?.len(), 2);
    assert_eq!(service.list_pending(Some(SourceKind::BulkImport))?.len(), 1);
    assert_eq!(service.list_pending(Some(SourceKind::SingleField))?.len(), 1);

    let resolver = utils::new_bech32_id("user")?;
    let outcomes =
        service.resolve_all_pending(Some(SourceKind::BulkImport), Decision::Approved, &resolver)?;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].entity_key, "1502");

    let still_pending = service.list_pending(None)?;
    assert_eq!(still_pending.len(), 1);
    assert_eq!(still_pending[0].source.kind(), SourceKind::SingleField);
    Ok(())
}
