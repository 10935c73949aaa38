//! Canonical and candidate record types plus the field schema that gives
//! their free-form values semantics.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::error::WorkflowError;

/// Which canonical collection an entity key resolves into.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    #[n(0)]
    Employee,
    #[n(1)]
    Rider,
}

/// Semantic type of a schema field; drives normalization before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Case-insensitive identifiers (residency numbers, IBANs, working ids).
    Identifier,
    Text,
    Date,
    /// Closed vocabulary, compared lowercase (status, role).
    Choice,
    Flag,
    Number,
}

/// One recognized field: its canonical name, semantics, and the normalized
/// spreadsheet header spellings that map onto it.
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub is_key: bool,
    headers: &'static [&'static str],
}

/// Declaration order here is the order field changes are reported in.
pub const FIELD_SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        name: "residency_id",
        kind: FieldKind::Identifier,
        is_key: true,
        headers: &["residencyid", "residencyno", "nationalid", "iqamano", "iqamaid"],
    },
    FieldSpec {
        name: "name_ar",
        kind: FieldKind::Text,
        is_key: false,
        headers: &["namear", "arabicname", "namearabic"],
    },
    FieldSpec {
        name: "name_en",
        kind: FieldKind::Text,
        is_key: false,
        headers: &["nameen", "englishname", "nameenglish", "name"],
    },
    FieldSpec {
        name: "birth_date",
        kind: FieldKind::Date,
        is_key: false,
        headers: &["birthdate", "dateofbirth", "dob"],
    },
    FieldSpec {
        name: "join_date",
        kind: FieldKind::Date,
        is_key: false,
        headers: &["joindate", "joiningdate", "hiredate"],
    },
    FieldSpec {
        name: "status",
        kind: FieldKind::Choice,
        is_key: false,
        headers: &["status", "state", "accountstatus"],
    },
    FieldSpec {
        name: "role",
        kind: FieldKind::Choice,
        is_key: false,
        headers: &["role", "jobrole", "position"],
    },
    FieldSpec {
        name: "working_id",
        kind: FieldKind::Identifier,
        is_key: false,
        headers: &["workingid", "workid", "employeeno"],
    },
    FieldSpec {
        name: "phone",
        kind: FieldKind::Identifier,
        is_key: false,
        headers: &["phone", "phoneno", "mobile", "mobileno"],
    },
    FieldSpec {
        name: "iban",
        kind: FieldKind::Identifier,
        is_key: false,
        headers: &["iban", "ibanno", "bankaccount"],
    },
    FieldSpec {
        name: "bank_name",
        kind: FieldKind::Text,
        is_key: false,
        headers: &["bankname", "bank"],
    },
    FieldSpec {
        name: "salary",
        kind: FieldKind::Number,
        is_key: false,
        headers: &["salary", "basicsalary"],
    },
];

/// Resolve a field by its canonical name.
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELD_SCHEMA.iter().find(|spec| spec.name == name)
}

/// Resolve a candidate column header to a schema field, tolerating case,
/// whitespace, dash and underscore variations. Unrecognized headers resolve
/// to `None` and are ignored by callers.
pub fn spec_for_header(header: &str) -> Option<&'static FieldSpec> {
    let folded = fold_header(header);
    FIELD_SCHEMA
        .iter()
        .find(|spec| fold_header(spec.name) == folded || spec.headers.contains(&folded.as_str()))
}

fn fold_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-' | '(' | ')' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

fn canonical_date(raw: &str) -> Option<String> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Comparison form of a raw value. Two raw values denote the same field
/// state exactly when their normalized forms are equal.
pub fn normalize(kind: FieldKind, raw: &str) -> String {
    let trimmed = raw.trim();
    match kind {
        FieldKind::Identifier => trimmed.to_uppercase(),
        FieldKind::Text => trimmed.to_string(),
        FieldKind::Choice | FieldKind::Flag => trimmed.to_lowercase(),
        FieldKind::Date => canonical_date(trimmed).unwrap_or_else(|| trimmed.to_string()),
        FieldKind::Number => trimmed
            .parse::<i64>()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| trimmed.to_string()),
    }
}

/// Storage form of a raw value: trimmed, with dates canonicalized so that
/// later diffs compare against a stable spelling.
pub fn canonical(kind: FieldKind, raw: &str) -> String {
    let trimmed = raw.trim();
    match kind {
        FieldKind::Date => canonical_date(trimmed).unwrap_or_else(|| trimmed.to_string()),
        _ => trimmed.to_string(),
    }
}

/// The authoritative entity record. Owned by the canonical store; the
/// workflow only touches it through the atomic apply step in resolution.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    #[n(0)]
    pub entity_key: String,
    #[n(1)]
    pub kind: RecordKind,
    #[n(2)]
    pub fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn new(entity_key: impl Into<String>, kind: RecordKind) -> Self {
        Self {
            entity_key: entity_key.into(),
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn set_field(mut self, name: &str, value: &str) -> Self {
        let kind = field_spec(name).map(|spec| spec.kind).unwrap_or(FieldKind::Text);
        self.fields.insert(name.to_string(), canonical(kind, value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Current value of a field in comparison form.
    pub fn normalized_field(&self, spec: &FieldSpec) -> Option<String> {
        self.field(spec.name).map(|value| normalize(spec.kind, value))
    }
}

/// An untrusted bag of proposed values from an external source. Carries no
/// identity guarantee beyond (possibly) a key column.
#[derive(Debug, Clone, Default)]
pub struct CandidateRecord {
    columns: Vec<(String, String)>,
}

impl CandidateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, header: &str, value: &str) -> Self {
        self.columns.push((header.to_string(), value.to_string()));
        self
    }

    /// Extract the entity key column. Missing, unrecognized, or blank keys
    /// fail validation; a bulk batch counts such rows as invalid and moves on.
    pub fn entity_key(&self) -> Result<String, WorkflowError> {
        let value = self
            .columns
            .iter()
            .find(|(header, _)| spec_for_header(header).is_some_and(|spec| spec.is_key))
            .map(|(_, value)| value.trim())
            .ok_or_else(|| WorkflowError::Validation("candidate row has no entity key column".into()))?;

        if value.is_empty() {
            return Err(WorkflowError::Validation("candidate entity key is blank".into()));
        }
        Ok(value.to_string())
    }

    /// First non-blank candidate value for a schema field, raw.
    pub fn value_of(&self, spec: &FieldSpec) -> Option<&str> {
        self.columns
            .iter()
            .filter(|(header, _)| {
                spec_for_header(header).is_some_and(|matched| matched.name == spec.name)
            })
            .map(|(_, value)| value.trim())
            .find(|value| !value.is_empty())
    }
}

/// UTC timestamp newtype so persisted encodings stay fixed at millisecond
/// precision regardless of chrono internals.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }

    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0.timestamp_millis())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let millis = d.i64()?;

        DateTime::from_timestamp_millis(millis)
            .map(TimeStamp)
            .ok_or(minicbor::decode::Error::message(
                "timestamp out of range for utc conversion",
            ))
    }
}
