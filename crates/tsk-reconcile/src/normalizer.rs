//! Record Normalizer: heterogeneous wire payloads to canonical records.
//!
//! # Purpose
//! REST responses and push frames carry tasks in several shapes: the record
//! at top level, the record nested under an envelope field, lists of either,
//! and two spellings of the identifier. This module is the single place that
//! resolves those shapes, in a fixed order:
//!
//! 1. Envelope: if the object has a `task` object, that is the record.
//! 2. Identifier: `id`, then the legacy `_id`. Neither -> [`MalformedPayload`].
//! 3. Correlation token: `correlationToken` (or `correlation_token`) on the
//!    record, then on the envelope. Lifted out of the fields.
//! 4. Everything else passes through into `fields` unchanged.
//!
//! # Design constraints
//! - Pure, deterministic conversion. No IO.
//! - Idempotent: normalizing [`CanonicalRecord::to_wire`] output yields the
//!   same identity and fields.
//!
//! [`CanonicalRecord::to_wire`]: crate::CanonicalRecord::to_wire

use serde_json::{Map, Value};

use crate::{CanonicalRecord, CorrelationToken, Fields};

/// Object field a single record may be nested under.
pub const RECORD_ENVELOPE: &str = "task";
/// Object field a record list may be nested under.
pub const LIST_ENVELOPE: &str = "tasks";
/// Primary identifier field.
pub const PRIMARY_ID: &str = "id";
/// Legacy identifier field, consulted only when the primary one is absent.
pub const LEGACY_ID: &str = "_id";
/// Correlation token field echoed back by servers that support it.
pub const CORRELATION_FIELD: &str = "correlationToken";
const CORRELATION_FIELD_SNAKE: &str = "correlation_token";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Input that cannot be normalized. The offending event is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayload {
    /// The payload (or its envelope) is not a JSON object.
    NotAnObject { found: &'static str },
    /// Neither the primary nor the legacy identifier is present.
    MissingIdentity,
    /// An identifier is present but is not a string or an integer.
    InvalidIdentity {
        field: &'static str,
        found: &'static str,
    },
}

impl std::fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject { found } => {
                write!(f, "malformed payload: expected object, found {found}")
            }
            Self::MissingIdentity => write!(
                f,
                "malformed payload: neither '{PRIMARY_ID}' nor '{LEGACY_ID}' is present"
            ),
            Self::InvalidIdentity { field, found } => write!(
                f,
                "malformed payload: identifier '{field}' must be a string or integer, found {found}"
            ),
        }
    }
}

impl std::error::Error for MalformedPayload {}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A normalized remote record, before the store decides what it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub identity: String,
    pub fields: Fields,
    pub correlation: Option<CorrelationToken>,
}

impl NormalizedRecord {
    pub fn new(identity: impl Into<String>, fields: Fields) -> Self {
        Self {
            identity: identity.into(),
            fields,
            correlation: None,
        }
    }

    pub fn with_correlation(mut self, token: CorrelationToken) -> Self {
        self.correlation = Some(token);
        self
    }

    pub fn into_confirmed(self) -> CanonicalRecord {
        CanonicalRecord::confirmed(self.identity, self.fields)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Returns (record object, enclosing envelope if any).
fn unwrap_envelope(raw: &Value) -> Result<(&Map<String, Value>, Option<&Map<String, Value>>), MalformedPayload> {
    let obj = raw.as_object().ok_or(MalformedPayload::NotAnObject {
        found: kind_of(raw),
    })?;
    match obj.get(RECORD_ENVELOPE) {
        Some(Value::Object(inner)) => Ok((inner, Some(obj))),
        _ => Ok((obj, None)),
    }
}

fn identity_from(obj: &Map<String, Value>) -> Result<Option<String>, MalformedPayload> {
    for field in [PRIMARY_ID, LEGACY_ID] {
        match obj.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => continue,
            Some(Value::String(s)) => return Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => return Ok(Some(n.to_string())),
            Some(other) => {
                return Err(MalformedPayload::InvalidIdentity {
                    field,
                    found: kind_of(other),
                })
            }
        }
    }
    Ok(None)
}

fn correlation_from(obj: &Map<String, Value>) -> Option<CorrelationToken> {
    [CORRELATION_FIELD, CORRELATION_FIELD_SNAKE]
        .iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(CorrelationToken::new)
}

fn is_reserved(key: &str) -> bool {
    matches!(
        key,
        PRIMARY_ID | LEGACY_ID | CORRELATION_FIELD | CORRELATION_FIELD_SNAKE
    )
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Normalize one record payload (top-level or `task`-wrapped).
pub fn normalize_record(raw: &Value) -> Result<NormalizedRecord, MalformedPayload> {
    let (record, envelope) = unwrap_envelope(raw)?;

    let identity = identity_from(record)?.ok_or(MalformedPayload::MissingIdentity)?;

    let correlation = correlation_from(record).or_else(|| envelope.and_then(correlation_from));

    let fields: Fields = record
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(NormalizedRecord {
        identity,
        fields,
        correlation,
    })
}

/// Normalize a list payload lazily, one result per item.
///
/// Accepts a bare array, a `{ "tasks": [...] }` envelope, or a single record.
/// Any other shape yields an empty sequence.
pub fn normalize_list(
    raw: &Value,
) -> impl Iterator<Item = Result<NormalizedRecord, MalformedPayload>> + '_ {
    let items: &[Value] = match raw {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get(LIST_ENVELOPE) {
            Some(Value::Array(items)) => items,
            _ if obj.contains_key(PRIMARY_ID)
                || obj.contains_key(LEGACY_ID)
                || obj.contains_key(RECORD_ENVELOPE) =>
            {
                std::slice::from_ref(raw)
            }
            _ => &[],
        },
        _ => &[],
    };
    items.iter().map(normalize_record)
}

/// Extract only the identity, as delete notifications carry nothing else.
///
/// Accepts a bare string, `{ "id": .. }`, `{ "_id": .. }`, or the `task`
/// envelope around either.
pub fn normalize_identity(raw: &Value) -> Result<String, MalformedPayload> {
    if let Value::String(s) = raw {
        let s = s.trim();
        if s.is_empty() {
            return Err(MalformedPayload::MissingIdentity);
        }
        return Ok(s.to_string());
    }
    let (record, _) = unwrap_envelope(raw)?;
    identity_from(record)?.ok_or(MalformedPayload::MissingIdentity)
}
