//! Document model shared by the store, the remote client and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

use crate::types::{CollectionPath, DocumentKey};

/// Field name to value mapping held by a document.
pub type Fields = BTreeMap<String, Value>;

/// Revision assigned by the server on every accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerRevision {
    /// Per-document version, increasing by one per accepted write.
    pub version: u64,
    /// Server time of the write.
    pub updated_at: DateTime<Utc>,
}

impl ServerRevision {
    /// Create a revision.
    pub fn new(version: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            version,
            updated_at,
        }
    }
}

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Document written in full; replaces whatever the server holds.
    Create,
    /// Listed fields merged into the existing document.
    Update,
    /// Document removed.
    Delete,
}

impl ChangeType {
    /// Net effect of applying `self` and then `later` to the same document.
    pub fn then(self, later: ChangeType) -> ChangeType {
        match (self, later) {
            (_, ChangeType::Delete) => ChangeType::Delete,
            (ChangeType::Delete, _) => ChangeType::Create,
            (ChangeType::Create, ChangeType::Update) => ChangeType::Create,
            (_, later) => later,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// Change to a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FieldChange {
    /// Overwrite with a value.
    Set(Value),
    /// Remove the field.
    Remove,
    /// Add to the numeric value; missing or non-numeric counts as zero.
    Increment(Number),
}

impl FieldChange {
    /// Coalesce two successive changes of one field into one.
    pub fn then(self, later: FieldChange) -> FieldChange {
        match (self, later) {
            (_, FieldChange::Set(value)) => FieldChange::Set(value),
            (_, FieldChange::Remove) => FieldChange::Remove,
            (FieldChange::Increment(a), FieldChange::Increment(b)) => {
                FieldChange::Increment(sum_numbers(&a, &b))
            }
            (FieldChange::Set(value), FieldChange::Increment(by)) => {
                FieldChange::Set(add_numbers(Some(&value), &by))
            }
            (FieldChange::Remove, FieldChange::Increment(by)) => {
                FieldChange::Set(Value::Number(by))
            }
        }
    }

    /// Apply this change to the current value of a field.
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        match self {
            FieldChange::Set(value) => Some(value.clone()),
            FieldChange::Remove => None,
            FieldChange::Increment(by) => Some(add_numbers(current, by)),
        }
    }
}

/// Field-level delta of one mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldDelta {
    changes: BTreeMap<String, FieldChange>,
}

impl FieldDelta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta that sets every field of `fields`.
    pub fn from_fields(fields: &Fields) -> Self {
        let changes = fields
            .iter()
            .map(|(name, value)| (name.clone(), FieldChange::Set(value.clone())))
            .collect();
        Self { changes }
    }

    /// Record a change, coalescing with any existing change of that field.
    pub fn push(&mut self, field: impl Into<String>, change: FieldChange) {
        let field = field.into();
        let merged = match self.changes.remove(&field) {
            Some(existing) => existing.then(change),
            None => change,
        };
        self.changes.insert(field, merged);
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FieldChange::Set(value.into()));
        self
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.push(field, FieldChange::Remove);
        self
    }

    pub fn increment(mut self, field: impl Into<String>, by: impl Into<Number>) -> Self {
        self.push(field, FieldChange::Increment(by.into()));
        self
    }

    /// Fold a later delta into this one, field by field.
    pub fn merge(&mut self, later: &FieldDelta) {
        for (field, change) in &later.changes {
            self.push(field.clone(), change.clone());
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldChange)> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Apply every change to a field map.
    pub fn apply_to(&self, fields: &mut Fields) {
        for (name, change) in &self.changes {
            match change.apply(fields.get(name)) {
                Some(value) => {
                    fields.insert(name.clone(), value);
                }
                None => {
                    fields.remove(name);
                }
            }
        }
    }
}

impl FromIterator<(String, FieldChange)> for FieldDelta {
    fn from_iter<I: IntoIterator<Item = (String, FieldChange)>>(iter: I) -> Self {
        let mut delta = FieldDelta::new();
        for (field, change) in iter {
            delta.push(field, change);
        }
        delta
    }
}

/// A versioned record held in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Collection path plus id.
    pub key: DocumentKey,
    /// Field values.
    pub fields: Fields,
    /// Increases on every local mutation.
    pub local_revision: u64,
    /// Last server revision this document reflects.
    pub server_revision: Option<ServerRevision>,
    /// Tombstone: deleted locally, remote deletion not yet acknowledged.
    pub deleted: bool,
    /// Time of the last change, local or remote.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create an empty, never-written document.
    pub fn new(key: DocumentKey) -> Self {
        Self {
            key,
            fields: Fields::new(),
            local_revision: 0,
            server_revision: None,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    /// Create a document as fetched from the server.
    pub fn from_server(key: DocumentKey, fields: Fields, revision: ServerRevision) -> Self {
        Self {
            key,
            fields,
            local_revision: 0,
            server_revision: Some(revision),
            deleted: false,
            updated_at: revision.updated_at,
        }
    }

    pub fn collection(&self) -> &CollectionPath {
        self.key.collection()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Server version this document was last reconciled with.
    pub fn server_version(&self) -> Option<u64> {
        self.server_revision.map(|r| r.version)
    }
}

/// Watermark of a collection's server change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub collection: CollectionPath,
    /// Sequence number of the last applied server change.
    pub sequence: u64,
}

impl SyncCursor {
    pub fn new(collection: CollectionPath, sequence: u64) -> Self {
        Self {
            collection,
            sequence,
        }
    }
}

/// Add `by` to a numeric value; absent or non-numeric values count as zero.
pub fn add_numbers(base: Option<&Value>, by: &Number) -> Value {
    let zero = Number::from(0);
    let base = base.and_then(Value::as_number).unwrap_or(&zero);
    Value::Number(sum_numbers(base, by))
}

/// Sum two JSON numbers, staying integral when both sides are.
pub fn sum_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
}

/// `new - old` when `new` is numeric; an absent `old` counts as zero.
pub fn numeric_difference(old: Option<&Value>, new: &Value) -> Option<Number> {
    let new = new.as_number()?;
    let zero = Number::from(0);
    let old = old.and_then(Value::as_number).unwrap_or(&zero);
    if let (Some(x), Some(y)) = (new.as_i64(), old.as_i64()) {
        if let Some(diff) = x.checked_sub(y) {
            return Some(Number::from(diff));
        }
    }
    Number::from_f64(new.as_f64()? - old.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            (-1_000i64..1_000).prop_map(Value::from),
            "[a-z]{1,4}".prop_map(Value::from),
        ]
    }

    fn change_strategy() -> impl Strategy<Value = (String, FieldChange)> {
        let change = prop_oneof![
            value_strategy().prop_map(FieldChange::Set),
            Just(FieldChange::Remove),
            (-100i64..100).prop_map(|by| FieldChange::Increment(by.into())),
        ];
        (prop::sample::select(vec!["name", "room", "water_count"]), change)
            .prop_map(|(field, change)| (field.to_string(), change))
    }

    fn delta_strategy() -> impl Strategy<Value = FieldDelta> {
        prop::collection::vec(change_strategy(), 0..4)
            .prop_map(|changes| changes.into_iter().collect::<FieldDelta>())
    }

    #[test]
    fn test_field_change_coalescing() {
        let set = FieldChange::Set(json!(2));
        assert_eq!(
            set.clone().then(FieldChange::Increment(3.into())),
            FieldChange::Set(json!(5))
        );
        assert_eq!(
            FieldChange::Increment(1.into()).then(FieldChange::Increment(2.into())),
            FieldChange::Increment(3.into())
        );
        assert_eq!(set.clone().then(FieldChange::Remove), FieldChange::Remove);
        assert_eq!(
            FieldChange::Remove.then(FieldChange::Increment(4.into())),
            FieldChange::Set(json!(4))
        );
    }

    #[test]
    fn test_delta_apply() {
        let delta = FieldDelta::new()
            .set("name", "fern")
            .increment("water_count", 2)
            .remove("obsolete");

        let mut fields = Fields::new();
        fields.insert("water_count".into(), json!(1));
        fields.insert("obsolete".into(), json!(true));
        delta.apply_to(&mut fields);

        assert_eq!(fields.get("name"), Some(&json!("fern")));
        assert_eq!(fields.get("water_count"), Some(&json!(3)));
        assert!(!fields.contains_key("obsolete"));
    }

    #[test]
    fn test_delta_merge_keeps_latest_per_field() {
        let mut first = FieldDelta::new().set("a", 1).increment("n", 1);
        let second = FieldDelta::new().set("a", 2).increment("n", 4);
        first.merge(&second);
        assert_eq!(first.get("a"), Some(&FieldChange::Set(json!(2))));
        assert_eq!(first.get("n"), Some(&FieldChange::Increment(5.into())));
    }

    #[test]
    fn test_increment_on_non_numeric_counts_from_zero() {
        assert_eq!(add_numbers(Some(&json!("x")), &Number::from(3)), json!(3));
        assert_eq!(add_numbers(None, &Number::from(3)), json!(3));
    }

    #[test]
    fn test_float_arithmetic() {
        let by = Number::from_f64(0.5).unwrap();
        assert_eq!(add_numbers(Some(&json!(1)), &by), json!(1.5));
        assert_eq!(numeric_difference(Some(&json!(2)), &json!(3)), Some(1.into()));
        assert_eq!(numeric_difference(Some(&json!(2)), &json!("x")), None);
    }

    #[test]
    fn test_change_type_coalescing() {
        assert_eq!(ChangeType::Create.then(ChangeType::Update), ChangeType::Create);
        assert_eq!(ChangeType::Update.then(ChangeType::Update), ChangeType::Update);
        assert_eq!(ChangeType::Update.then(ChangeType::Delete), ChangeType::Delete);
        assert_eq!(ChangeType::Delete.then(ChangeType::Create), ChangeType::Create);
        assert_eq!(ChangeType::Delete.then(ChangeType::Update), ChangeType::Create);
    }

    #[test]
    fn test_document_serialization() {
        let key = DocumentKey::parse("plant/1").unwrap();
        let mut doc = Document::new(key);
        doc.fields.insert("water_count".into(), json!(2));
        doc.local_revision = 1;

        let json = serde_json::to_string(&doc).unwrap();
        let restored: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, doc);
    }

    proptest! {
        #[test]
        fn prop_merged_delta_applies_like_the_sequence(
            initial in prop::collection::btree_map(
                prop::sample::select(vec!["name", "room", "water_count"]).prop_map(String::from),
                value_strategy(),
                0..3,
            ),
            deltas in prop::collection::vec(delta_strategy(), 1..5),
        ) {
            let mut sequential = initial.clone();
            for delta in &deltas {
                delta.apply_to(&mut sequential);
            }

            let mut merged = FieldDelta::new();
            for delta in &deltas {
                merged.merge(delta);
            }
            let mut coalesced = initial;
            merged.apply_to(&mut coalesced);

            prop_assert_eq!(coalesced, sequential);
        }
    }
}
