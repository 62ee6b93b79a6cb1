//! Outbox event model, entity/operation vocabulary, and broker topic mapping.
//!
//! Every entity mutation is announced by exactly one [`Event`] row written in
//! the same transaction as the mutation (the outbox). The dispatcher later
//! publishes the serialized event to the topic derived from its
//! [`EntityType`], keyed by the entity id so that events for one entity keep
//! their relative order on the broker.
//!
//! ## Naming
//!
//! Event names are `<entity>.<past-tense operation>`, e.g. `note.created`.
//! Two names fall outside that rule: `task.completed` (a task update whose
//! `completed` flag flipped to `true`) and `sync.applied` (an audit record of a
//! compensating write made by the cross-entity sync service).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults::EVENT_SCHEMA_VERSION;
use crate::error::{Error, Result};

// ============================================================================
// Topics
// ============================================================================

/// Topic carrying note events.
pub const NOTE_TOPIC: &str = "note-events";
/// Topic carrying notebook events.
pub const NOTEBOOK_TOPIC: &str = "notebook-events";
/// Topic carrying block events.
pub const BLOCK_TOPIC: &str = "block-events";
/// Topic carrying task events.
pub const TASK_TOPIC: &str = "task-events";
/// Topic carrying sync audit events.
pub const SYNC_TOPIC: &str = "sync-events";

/// Every domain topic. The realtime fanout consumes all of them.
pub const ALL_TOPICS: [&str; 5] = [NOTE_TOPIC, NOTEBOOK_TOPIC, BLOCK_TOPIC, TASK_TOPIC, SYNC_TOPIC];

/// Topics consumed by the cross-entity sync service.
pub const SYNC_SERVICE_TOPICS: [&str; 2] = [BLOCK_TOPIC, TASK_TOPIC];

/// Name of a task update that flipped `completed` to `true`.
pub const TASK_COMPLETED_EVENT: &str = "task.completed";
/// Name of the audit event recorded with every compensating sync write.
pub const SYNC_APPLIED_EVENT: &str = "sync.applied";

// ============================================================================
// Vocabulary
// ============================================================================

/// Logical entity type an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Note,
    Notebook,
    Block,
    Task,
    Sync,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Note => "note",
            EntityType::Notebook => "notebook",
            EntityType::Block => "block",
            EntityType::Task => "task",
            EntityType::Sync => "sync",
        }
    }

    /// Broker topic for events of this entity type.
    pub fn topic(&self) -> &'static str {
        match self {
            EntityType::Note => NOTE_TOPIC,
            EntityType::Notebook => NOTEBOOK_TOPIC,
            EntityType::Block => BLOCK_TOPIC,
            EntityType::Task => TASK_TOPIC,
            EntityType::Sync => SYNC_TOPIC,
        }
    }

    /// Standard event name for an operation on this entity type.
    pub fn event_name(&self, operation: Operation) -> String {
        format!("{}.{}", self.as_str(), operation.past_tense())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "note" => Ok(EntityType::Note),
            "notebook" => Ok(EntityType::Notebook),
            "block" => Ok(EntityType::Block),
            "task" => Ok(EntityType::Task),
            "sync" => Ok(EntityType::Sync),
            other => Err(Error::InvalidInput(format!("unknown entity type: {other}"))),
        }
    }
}

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Operation::Create => "created",
            Operation::Update => "updated",
            Operation::Delete => "deleted",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation: {other}"))),
        }
    }
}

/// Dispatch status of an outbox row.
///
/// `Failed` records that the latest publish attempt failed; the row is still
/// undispatched and is retried on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Dispatched => "dispatched",
            EventStatus::Failed => "failed",
        }
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "dispatched" => Ok(EventStatus::Dispatched),
            "failed" => Ok(EventStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown event status: {other}"))),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// A persisted outbox record describing one entity mutation.
///
/// Immutable after insert except for the dispatch bookkeeping fields
/// (`status`, `dispatched`, `dispatched_at`, `attempts`, `last_error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub entity: EntityType,
    pub entity_id: Uuid,
    pub operation: Operation,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
    pub status: EventStatus,
    pub dispatched: bool,
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Event {
    /// Build a pending event with the standard name for `operation`.
    ///
    /// Fails only if `payload` cannot be serialized; nothing is written.
    pub fn pending<P: Serialize + ?Sized>(
        entity: EntityType,
        operation: Operation,
        actor_id: &str,
        entity_id: Uuid,
        payload: &P,
    ) -> Result<Self> {
        Self::pending_named(
            entity.event_name(operation),
            entity,
            operation,
            actor_id,
            entity_id,
            payload,
        )
    }

    /// Build a pending event with an explicit name (e.g. `task.completed`).
    pub fn pending_named<P: Serialize + ?Sized>(
        name: impl Into<String>,
        entity: EntityType,
        operation: Operation,
        actor_id: &str,
        entity_id: Uuid,
        payload: &P,
    ) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self {
            id: crate::uuid_utils::new_v7(),
            name: name.into(),
            version: EVENT_SCHEMA_VERSION,
            entity,
            entity_id,
            operation,
            actor_id: actor_id.to_string(),
            timestamp: Utc::now(),
            payload,
            status: EventStatus::Pending,
            dispatched: false,
            dispatched_at: None,
            attempts: 0,
            last_error: None,
        })
    }

    /// Topic this event is published to.
    pub fn topic(&self) -> &'static str {
        self.entity.topic()
    }

    /// Broker partition key: the entity id.
    pub fn key(&self) -> String {
        self.entity_id.to_string()
    }

    /// Serialized wire form published to the broker.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an event from its broker wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The resource this event concerns for access control and subscription
    /// matching.
    ///
    /// `sync.applied` events describe a write to another entity; they resolve
    /// to that target (`target_type` / `target_id` in the payload).
    pub fn resource(&self) -> (EntityType, Uuid) {
        if self.entity == EntityType::Sync {
            let target_type = self
                .payload
                .get("target_type")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<EntityType>().ok());
            let target_id = self
                .payload
                .get("target_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            if let (Some(t), Some(id)) = (target_type, target_id) {
                return (t, id);
            }
        }
        (self.entity, self.entity_id)
    }
}

/// Payload of a `sync.applied` audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAppliedPayload {
    pub source_type: EntityType,
    pub source_id: Uuid,
    pub target_type: EntityType,
    pub target_id: Uuid,
    pub title: String,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_mapping() {
        assert_eq!(EntityType::Note.topic(), "note-events");
        assert_eq!(EntityType::Notebook.topic(), "notebook-events");
        assert_eq!(EntityType::Block.topic(), "block-events");
        assert_eq!(EntityType::Task.topic(), "task-events");
        assert_eq!(EntityType::Sync.topic(), "sync-events");
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EntityType::Note.event_name(Operation::Create), "note.created");
        assert_eq!(EntityType::Task.event_name(Operation::Update), "task.updated");
        assert_eq!(EntityType::Block.event_name(Operation::Delete), "block.deleted");
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!("notebook".parse::<EntityType>().unwrap(), EntityType::Notebook);
        assert!("folder".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_pending_event_defaults() {
        let id = Uuid::new_v4();
        let event = Event::pending(
            EntityType::Note,
            Operation::Create,
            "user-1",
            id,
            &json!({"title": "Hello"}),
        )
        .unwrap();

        assert_eq!(event.name, "note.created");
        assert_eq!(event.version, EVENT_SCHEMA_VERSION);
        assert_eq!(event.status, EventStatus::Pending);
        assert!(!event.dispatched);
        assert!(event.dispatched_at.is_none());
        assert_eq!(event.key(), id.to_string());
        assert_eq!(event.topic(), NOTE_TOPIC);
        assert_eq!(event.id.get_version_num(), 7);
    }

    #[test]
    fn test_pending_event_serialization_failure() {
        use std::collections::HashMap;
        // Non-string map keys cannot become JSON object keys.
        let mut bad: HashMap<(i32, i32), i32> = HashMap::new();
        bad.insert((1, 2), 3);
        let result = Event::pending(
            EntityType::Note,
            Operation::Update,
            "user-1",
            Uuid::new_v4(),
            &bad,
        );
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_wire_roundtrip_preserves_identity() {
        let event = Event::pending(
            EntityType::Task,
            Operation::Update,
            "user-2",
            Uuid::new_v4(),
            &json!({"completed": true}),
        )
        .unwrap();
        let decoded = Event::from_wire(&event.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_sync_event_resolves_target_resource() {
        let task_id = Uuid::new_v4();
        let payload = SyncAppliedPayload {
            source_type: EntityType::Block,
            source_id: Uuid::new_v4(),
            target_type: EntityType::Task,
            target_id: task_id,
            title: "Ship it".to_string(),
            completed: true,
        };
        let event = Event::pending_named(
            "sync.applied",
            EntityType::Sync,
            Operation::Update,
            "system:sync",
            task_id,
            &payload,
        )
        .unwrap();
        assert_eq!(event.resource(), (EntityType::Task, task_id));
        assert_eq!(event.topic(), SYNC_TOPIC);
    }

    #[test]
    fn test_plain_event_resource_is_entity() {
        let id = Uuid::new_v4();
        let event =
            Event::pending(EntityType::Block, Operation::Create, "u", id, &json!({})).unwrap();
        assert_eq!(event.resource(), (EntityType::Block, id));
    }
}
