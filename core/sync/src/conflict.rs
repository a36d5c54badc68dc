//! Conflict resolution for pushes the server refused.
//!
//! Resolution is pure: given the local document, the coalesced pending
//! change and the server's current state, it computes the merged local
//! state, what still has to be pushed, and whether the user should hear
//! about it. All I/O stays in the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use tideline_common::document::numeric_difference;
use tideline_common::{
    ChangeType, CollectionPath, Document, DocumentKey, FieldChange, FieldDelta, Fields,
    ServerRevision,
};
use tideline_remote::RemoteDocument;
use tideline_store::PendingChange;

/// Which fields merge additively, per collection.
///
/// Additive fields are counters: concurrent increments from several
/// replicas are summed instead of overwriting each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergePolicy {
    additive: BTreeMap<String, BTreeSet<String>>,
}

impl MergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `field` of `collection` as additive.
    pub fn with_additive(mut self, collection: impl Into<String>, field: impl Into<String>) -> Self {
        self.additive
            .entry(collection.into())
            .or_default()
            .insert(field.into());
        self
    }

    pub fn is_additive(&self, collection: &CollectionPath, field: &str) -> bool {
        self.additive
            .get(&collection.as_string())
            .is_some_and(|fields| fields.contains(field))
    }
}

/// Kind of conflict surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Newer server values replaced some local field changes.
    FieldsOverwritten,
    /// The document was deleted locally but changed on the server; the
    /// server copy was restored.
    DeleteOverridden,
    /// The document was updated locally but deleted on the server; the
    /// local update was dropped.
    UpdateOnDeleted,
}

/// Notification that local changes were discarded during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub key: DocumentKey,
    pub kind: ConflictKind,
    pub local_change: ChangeType,
    /// Local field changes that did not survive.
    pub discarded_fields: Vec<String>,
    pub local_mutated_at: DateTime<Utc>,
    pub server_revision: ServerRevision,
    pub detected_at: DateTime<Utc>,
}

/// Change still owed to the server after a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Requeue {
    pub change_type: ChangeType,
    pub delta: FieldDelta,
    /// Original local mutation time of each requeued field.
    pub field_mutated_at: BTreeMap<String, DateTime<Utc>>,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Local state after resolution; `None` removes the document.
    pub merged: Option<Document>,
    /// Change to push next, expecting the server's current revision.
    pub requeue: Option<Requeue>,
    pub event: Option<ConflictEvent>,
}

/// Field-level conflict resolver.
///
/// Non-additive fields follow last-writer-wins per field: a local change
/// survives only if that field was changed strictly after the server's last
/// write, and ties go to the server. Increments of additive fields always survive and are
/// applied on top of the server value.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: MergePolicy,
}

impl ConflictResolver {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Rewrite local `Set`s of numeric additive fields as increments
    /// relative to the value they replace.
    ///
    /// `current` is the document's visible fields before the change; a new
    /// document (`None`) keeps its values as-is.
    pub fn normalize_local_delta(
        &self,
        collection: &CollectionPath,
        current: Option<&Fields>,
        delta: FieldDelta,
    ) -> FieldDelta {
        let Some(current) = current else {
            return delta;
        };

        delta
            .iter()
            .map(|(name, change)| {
                let change = match change {
                    FieldChange::Set(value) if self.policy.is_additive(collection, name) => {
                        match numeric_difference(current.get(name), value) {
                            Some(diff) => FieldChange::Increment(diff),
                            None => change.clone(),
                        }
                    }
                    _ => change.clone(),
                };
                (name.clone(), change)
            })
            .collect()
    }

    /// Resolve a pending change against the server state that refused it.
    pub fn resolve(
        &self,
        local: Option<&Document>,
        pending: &PendingChange,
        server: &RemoteDocument,
    ) -> Resolution {
        let local_revision = local.map_or(0, |doc| doc.local_revision);
        let event = |kind, discarded_fields| ConflictEvent {
            key: pending.key.clone(),
            kind,
            local_change: pending.change_type,
            discarded_fields,
            local_mutated_at: pending.mutated_at,
            server_revision: server.revision,
            detected_at: Utc::now(),
        };

        match (pending.change_type, server.deleted) {
            (ChangeType::Delete, true) => Resolution {
                merged: None,
                requeue: None,
                event: None,
            },
            (ChangeType::Delete, false) => {
                let mut restored = server.to_document();
                restored.local_revision = local_revision;
                Resolution {
                    merged: Some(restored),
                    requeue: None,
                    event: Some(event(ConflictKind::DeleteOverridden, Vec::new())),
                }
            }
            (ChangeType::Update, true) => {
                let discarded = pending.delta.iter().map(|(name, _)| name.clone()).collect();
                Resolution {
                    merged: None,
                    requeue: None,
                    event: Some(event(ConflictKind::UpdateOnDeleted, discarded)),
                }
            }
            (ChangeType::Create, true) => {
                // Recreating a document the server deleted: the local
                // document stands as written.
                let mut fields = Fields::new();
                pending.delta.apply_to(&mut fields);
                Resolution {
                    merged: Some(Document {
                        key: pending.key.clone(),
                        fields,
                        local_revision,
                        server_revision: Some(server.revision),
                        deleted: false,
                        updated_at: pending.mutated_at,
                    }),
                    requeue: Some(Requeue {
                        change_type: ChangeType::Create,
                        delta: pending.delta.clone(),
                        field_mutated_at: pending.field_mutated_at.clone(),
                    }),
                    event: None,
                }
            }
            (ChangeType::Create | ChangeType::Update, false) => {
                self.merge_fields(local_revision, pending, server, event)
            }
        }
    }

    fn merge_fields(
        &self,
        local_revision: u64,
        pending: &PendingChange,
        server: &RemoteDocument,
        event: impl Fn(ConflictKind, Vec<String>) -> ConflictEvent,
    ) -> Resolution {
        let collection = pending.key.collection();

        let mut fields = server.fields.clone();
        let mut requeue = FieldDelta::new();
        let mut requeue_times = BTreeMap::new();
        let mut discarded = Vec::new();

        for (name, change) in pending.delta.iter() {
            let additive = matches!(change, FieldChange::Increment(_))
                && self.policy.is_additive(collection, name);
            let mutated_at = pending.field_time(name);
            let local_wins = mutated_at > server.revision.updated_at;

            if additive || local_wins {
                match change.apply(fields.get(name)) {
                    Some(value) => {
                        fields.insert(name.clone(), value);
                    }
                    None => {
                        fields.remove(name);
                    }
                }
                requeue.push(name.clone(), change.clone());
                requeue_times.insert(name.clone(), mutated_at);
            } else if change.apply(server.fields.get(name)).as_ref() != server.fields.get(name) {
                discarded.push(name.clone());
            }
        }

        let updated_at = requeue_times
            .values()
            .max()
            .copied()
            .unwrap_or(server.revision.updated_at);

        Resolution {
            merged: Some(Document {
                key: pending.key.clone(),
                fields,
                local_revision,
                server_revision: Some(server.revision),
                deleted: false,
                updated_at,
            }),
            requeue: (!requeue.is_empty()).then(|| Requeue {
                change_type: ChangeType::Update,
                delta: requeue,
                field_mutated_at: requeue_times,
            }),
            event: (!discarded.is_empty())
                .then(|| event(ConflictKind::FieldsOverwritten, discarded)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn key() -> DocumentKey {
        DocumentKey::parse("plant/1").unwrap()
    }

    fn plants() -> CollectionPath {
        CollectionPath::parse("plant").unwrap()
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(MergePolicy::new().with_additive("plant", "water_count"))
    }

    fn pending(change_type: ChangeType, delta: FieldDelta, at: DateTime<Utc>) -> PendingChange {
        let field_mutated_at = delta_times(&delta, at);
        PendingChange {
            key: key(),
            change_type,
            delta,
            entry_ids: vec![1],
            expected_revision: Some(ServerRevision::new(1, at - Duration::hours(1))),
            local_revision: 2,
            mutated_at: at,
            field_mutated_at,
        }
    }

    fn delta_times(delta: &FieldDelta, at: DateTime<Utc>) -> BTreeMap<String, DateTime<Utc>> {
        delta.iter().map(|(name, _)| (name.clone(), at)).collect()
    }

    fn server(fields: Value, version: u64, at: DateTime<Utc>) -> RemoteDocument {
        let fields: Fields = serde_json::from_value(fields).unwrap();
        RemoteDocument {
            key: key(),
            fields,
            revision: ServerRevision::new(version, at),
            deleted: false,
        }
    }

    #[test]
    fn test_additive_set_becomes_increment() {
        let mut current = Fields::new();
        current.insert("water_count".into(), json!(2));
        current.insert("name".into(), json!("fern"));

        let delta = FieldDelta::new().set("water_count", 3).set("name", "ivy");
        let normalized = resolver().normalize_local_delta(&plants(), Some(&current), delta);

        assert_eq!(normalized.get("water_count"), Some(&FieldChange::Increment(1.into())));
        assert_eq!(normalized.get("name"), Some(&FieldChange::Set(json!("ivy"))));
    }

    #[test]
    fn test_plant_watering_scenario() {
        // water_count 2 everywhere; local sets 3, another device sets 4.
        let now = Utc::now();
        let mut current = Fields::new();
        current.insert("water_count".into(), json!(2));
        let delta = resolver().normalize_local_delta(
            &plants(),
            Some(&current),
            FieldDelta::new().set("water_count", 3),
        );

        let resolution = resolver().resolve(
            None,
            &pending(ChangeType::Update, delta, now - Duration::seconds(5)),
            &server(json!({ "water_count": 4 }), 2, now),
        );

        let merged = resolution.merged.unwrap();
        assert_eq!(merged.field("water_count"), Some(&json!(5)));
        let requeue = resolution.requeue.unwrap();
        assert_eq!(requeue.delta.get("water_count"), Some(&FieldChange::Increment(1.into())));
        assert!(resolution.event.is_none());
    }

    #[test]
    fn test_increments_sum_in_either_order() {
        let now = Utc::now();
        let base = 10;

        // Local +3 lands on a server that already took +5.
        let a = resolver().resolve(
            None,
            &pending(ChangeType::Update, FieldDelta::new().increment("water_count", 3), now),
            &server(json!({ "water_count": base + 5 }), 2, now),
        );
        // Local +5 lands on a server that already took +3.
        let b = resolver().resolve(
            None,
            &pending(ChangeType::Update, FieldDelta::new().increment("water_count", 5), now),
            &server(json!({ "water_count": base + 3 }), 2, now),
        );

        assert_eq!(a.merged.unwrap().field("water_count"), Some(&json!(base + 8)));
        assert_eq!(b.merged.unwrap().field("water_count"), Some(&json!(base + 8)));
    }

    #[test]
    fn test_tie_goes_to_server() {
        let now = Utc::now();
        let resolution = resolver().resolve(
            None,
            &pending(ChangeType::Update, FieldDelta::new().set("name", "ivy"), now),
            &server(json!({ "name": "fern" }), 2, now),
        );

        assert_eq!(resolution.merged.unwrap().field("name"), Some(&json!("fern")));
        assert!(resolution.requeue.is_none());
        let event = resolution.event.unwrap();
        assert_eq!(event.kind, ConflictKind::FieldsOverwritten);
        assert_eq!(event.discarded_fields, vec!["name".to_string()]);
    }

    #[test]
    fn test_local_delete_vs_remote_update() {
        let now = Utc::now();
        let local = Document {
            key: key(),
            fields: Fields::new(),
            local_revision: 4,
            server_revision: Some(ServerRevision::new(1, now)),
            deleted: true,
            updated_at: now,
        };
        let resolution = resolver().resolve(
            Some(&local),
            &pending(ChangeType::Delete, FieldDelta::new(), now + Duration::seconds(1)),
            &server(json!({ "name": "fern" }), 2, now),
        );

        let restored = resolution.merged.unwrap();
        assert!(!restored.deleted);
        assert_eq!(restored.local_revision, 4);
        assert_eq!(restored.field("name"), Some(&json!("fern")));
        assert!(resolution.requeue.is_none());
        assert_eq!(resolution.event.unwrap().kind, ConflictKind::DeleteOverridden);
    }

    #[test]
    fn test_local_update_vs_remote_delete() {
        let now = Utc::now();
        let mut deleted = server(json!({}), 3, now);
        deleted.deleted = true;

        let resolution = resolver().resolve(
            None,
            &pending(ChangeType::Update, FieldDelta::new().set("name", "ivy"), now),
            &deleted,
        );

        assert!(resolution.merged.is_none());
        assert!(resolution.requeue.is_none());
        let event = resolution.event.unwrap();
        assert_eq!(event.kind, ConflictKind::UpdateOnDeleted);
        assert_eq!(event.discarded_fields, vec!["name".to_string()]);
    }

    #[test]
    fn test_older_field_loses_even_with_newer_sibling() {
        let now = Utc::now();
        let mut coalesced = pending(
            ChangeType::Update,
            FieldDelta::new().set("name", "oak").set("room", "kitchen"),
            now + Duration::seconds(5),
        );
        coalesced
            .field_mutated_at
            .insert("name".to_string(), now - Duration::seconds(5));

        let resolution = resolver().resolve(
            None,
            &coalesced,
            &server(json!({ "name": "ivy" }), 2, now),
        );

        let merged = resolution.merged.unwrap();
        assert_eq!(merged.field("name"), Some(&json!("ivy")));
        assert_eq!(merged.field("room"), Some(&json!("kitchen")));
        assert_eq!(merged.updated_at, now + Duration::seconds(5));

        let requeue = resolution.requeue.unwrap();
        assert!(requeue.delta.get("name").is_none());
        assert_eq!(
            requeue.field_mutated_at.get("room"),
            Some(&(now + Duration::seconds(5)))
        );
        assert_eq!(resolution.event.unwrap().discarded_fields, vec!["name".to_string()]);
    }

    #[test]
    fn test_policy_roundtrip() {
        let policy = MergePolicy::new().with_additive("songs", "play_count");
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json, json!({ "songs": ["play_count"] }));
        let back: MergePolicy = serde_json::from_value(json).unwrap();
        assert!(back.is_additive(&CollectionPath::parse("songs").unwrap(), "play_count"));
        assert!(!back.is_additive(&plants(), "play_count"));
    }

    proptest! {
        #[test]
        fn prop_last_writer_wins(
            local_value in "[a-z]{1,8}",
            server_value in "[a-z]{1,8}",
            offset_ms in -5_000i64..5_000,
        ) {
            let server_at = Utc::now();
            let local_at = server_at + Duration::milliseconds(offset_ms);

            let resolution = resolver().resolve(
                None,
                &pending(ChangeType::Update, FieldDelta::new().set("name", local_value.clone()), local_at),
                &server(json!({ "name": server_value.clone() }), 2, server_at),
            );

            let expected = if local_at > server_at { local_value } else { server_value };
            let merged = resolution.merged.unwrap();
            prop_assert_eq!(merged.field("name"), Some(&json!(expected)));
        }
    }
}
