use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute name -> value. Sorted by name so two records with the same
/// content always compare and serialize identically.
pub type Fields = BTreeMap<String, Value>;

/// Attribute carrying the task title.
pub const TITLE_FIELD: &str = "title";

/// Attribute carrying the completion flag.
pub const COMPLETED_FIELD: &str = "completed";

/// Prefix of locally minted provisional identities. Never sent to the server.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Opaque value threaded from a local create to its REST outcome.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The one in-memory representation of a task, independent of wire shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Server identity, or a provisional identity while `provisional` is set.
    pub identity: String,
    pub fields: Fields,
    /// True until a REST confirmation supplies the server identity.
    pub provisional: bool,
    /// Local counter, bumped on every accepted mutation. Never transmitted.
    pub revision: u64,
}

impl CanonicalRecord {
    /// A confirmed record as first observed from a remote source.
    pub fn confirmed(identity: impl Into<String>, fields: Fields) -> Self {
        Self {
            identity: identity.into(),
            fields,
            provisional: false,
            revision: 0,
        }
    }

    /// Same identity, confirmation state and fields. `revision` is ignored:
    /// it only counts local processing steps.
    pub fn same_state(&self, other: &CanonicalRecord) -> bool {
        self.identity == other.identity
            && self.provisional == other.provisional
            && self.fields == other.fields
    }

    pub fn title(&self) -> Option<&str> {
        self.fields.get(TITLE_FIELD).and_then(Value::as_str)
    }

    /// Missing or non-boolean completion flag reads as `false`.
    pub fn completed(&self) -> bool {
        self.fields
            .get(COMPLETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Wire form: `{ "id": identity, ...fields }`.
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), Value::String(self.identity.clone()));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// `overlay` wins on conflicting keys; keys only in `base` survive.
pub fn merge_fields(base: &Fields, overlay: &Fields) -> Fields {
    let mut out = base.clone();
    for (k, v) in overlay {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// `base` wins on conflicting keys; `filler` only contributes missing keys.
pub fn fill_missing(base: &Fields, filler: &Fields) -> Fields {
    merge_fields(filler, base)
}

/// Build [`Fields`] from a JSON object. Non-objects yield empty fields.
pub fn fields_from_json(v: Value) -> Fields {
    match v {
        Value::Object(map) => map.into_iter().collect(),
        _ => Fields::new(),
    }
}

/// Immutable snapshot of the reconciled collection.
///
/// Ordered, unique by identity. Replaced wholesale on every emission, so a
/// held `Arc<View>` never changes underneath its holder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    version: u64,
    records: Vec<CanonicalRecord>,
}

impl View {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn next(&self, records: Vec<CanonicalRecord>) -> Self {
        Self {
            version: self.version + 1,
            records,
        }
    }

    /// Number of emissions that produced this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CanonicalRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&CanonicalRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    pub fn provisional_count(&self) -> usize {
        self.records.iter().filter(|r| r.provisional).count()
    }

    /// Same records in the same order, ignoring `revision` and `version`.
    pub fn same_content(&self, other: &View) -> bool {
        same_content(&self.records, &other.records)
    }
}

pub(crate) fn same_content(a: &[CanonicalRecord], b: &[CanonicalRecord]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        fields_from_json(v)
    }

    #[test]
    fn merge_overlay_wins() {
        let base = fields(json!({"title": "a", "completed": false}));
        let overlay = fields(json!({"completed": true}));
        let m = merge_fields(&base, &overlay);
        assert_eq!(m, fields(json!({"title": "a", "completed": true})));
    }

    #[test]
    fn fill_missing_keeps_base() {
        let base = fields(json!({"completed": true}));
        let filler = fields(json!({"title": "a", "completed": false}));
        let m = fill_missing(&base, &filler);
        assert_eq!(m, fields(json!({"title": "a", "completed": true})));
    }

    #[test]
    fn completed_defaults_to_false() {
        let r = CanonicalRecord::confirmed("srv-1", fields(json!({"title": "x"})));
        assert!(!r.completed());
        assert_eq!(r.title(), Some("x"));
    }

    #[test]
    fn same_state_ignores_revision() {
        let a = CanonicalRecord::confirmed("srv-1", fields(json!({"title": "x"})));
        let mut b = a.clone();
        b.revision = 7;
        assert!(a.same_state(&b));
        b.provisional = true;
        assert!(!a.same_state(&b));
    }

    #[test]
    fn to_wire_puts_identity_under_id() {
        let r = CanonicalRecord::confirmed("srv-1", fields(json!({"title": "x"})));
        assert_eq!(r.to_wire(), json!({"id": "srv-1", "title": "x"}));
    }
}
