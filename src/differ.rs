//! Field-level diffing between a candidate row and the current canonical
//! record.

use crate::record::{CandidateRecord, CanonicalRecord, FIELD_SCHEMA, canonical, normalize};
use crate::request::FieldChange;

/// Compute the field changes a candidate proposes against the current record
/// (`None` for a not-yet-existing entity).
///
/// Pure and deterministic: output order is schema declaration order, a field
/// appears only when its normalized value actually differs, unrecognized
/// candidate columns and blank values are ignored, and the key field itself
/// is never reported as a change.
pub fn diff(candidate: &CandidateRecord, current: Option<&CanonicalRecord>) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    for spec in FIELD_SCHEMA {
        if spec.is_key {
            continue;
        }
        let Some(raw) = candidate.value_of(spec) else {
            continue;
        };

        let proposed = normalize(spec.kind, raw);
        let live = current.and_then(|record| record.normalized_field(spec));

        if live.as_deref() == Some(proposed.as_str()) {
            continue;
        }

        changes.push(FieldChange {
            field: spec.name.to_string(),
            old: current.and_then(|record| record.field(spec.name)).map(str::to_string),
            new: canonical(spec.kind, raw),
        });
    }

    changes
}
