//! Core traits for Quire abstractions.
//!
//! These traits define the seams between the synchronization workers and
//! their collaborators, so each worker takes its dependencies as constructor
//! arguments and can be tested against in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EntityType, Event};
use crate::models::*;

// =============================================================================
// OUTBOX
// =============================================================================

/// Transaction-bound destination for outbox events.
///
/// Implemented by a database transaction: an event appended here persists
/// only if the surrounding transaction commits.
#[async_trait]
pub trait EventSink: Send {
    async fn append_event(&mut self, event: &Event) -> Result<()>;
}

/// Read/transition access to the outbox used by the dispatcher.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Undispatched events, oldest first (`timestamp`, then `id`).
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<Event>>;

    /// Mark an event dispatched (`dispatched = true`, `status = dispatched`).
    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Record a failed publish attempt. The event stays undispatched.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Fetch one event by id.
    async fn get(&self, id: Uuid) -> Result<Option<Event>>;

    /// Number of undispatched events.
    async fn pending_count(&self) -> Result<i64>;

    /// Audit trail for one entity, oldest first.
    async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Event>>;
}

// =============================================================================
// ENTITY REPOSITORIES
// =============================================================================
//
// Every mutating method writes the entity change and its outbox event in a
// single transaction. `actor_id` is recorded on the event.

#[async_trait]
pub trait NotebookRepository: Send + Sync {
    async fn create(&self, actor_id: &str, req: CreateNotebookRequest) -> Result<Notebook>;
    async fn get(&self, id: Uuid) -> Result<Option<Notebook>>;
    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateNotebookRequest)
        -> Result<Notebook>;
    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait NoteRepository: Send + Sync {
    async fn create(&self, actor_id: &str, req: CreateNoteRequest) -> Result<Note>;
    async fn get(&self, id: Uuid) -> Result<Option<Note>>;
    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateNoteRequest) -> Result<Note>;
    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait BlockRepository: Send + Sync {
    async fn create(&self, actor_id: &str, req: CreateBlockRequest) -> Result<Block>;
    async fn get(&self, id: Uuid) -> Result<Option<Block>>;
    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateBlockRequest) -> Result<Block>;
    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()>;

    /// The task block linked to `task_id`, if any.
    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<Block>>;

    /// Write `fields` into the block's metadata unless they already match.
    ///
    /// Compare-and-write happens inside one transaction; an equal comparison
    /// writes nothing and records no event.
    async fn apply_sync(
        &self,
        actor_id: &str,
        block_id: Uuid,
        source_task_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, actor_id: &str, req: CreateTaskRequest) -> Result<Task>;
    async fn get(&self, id: Uuid) -> Result<Option<Task>>;
    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateTaskRequest) -> Result<Task>;
    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()>;

    /// Write `fields` onto the task unless they already match.
    async fn apply_sync(
        &self,
        actor_id: &str,
        task_id: Uuid,
        source_block_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome>;
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Capability check consulted before delivering any realtime message.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn has_access(
        &self,
        user_id: Uuid,
        resource_id: Uuid,
        resource_type: EntityType,
        minimum_role: Role,
    ) -> Result<bool>;
}

/// Validates a bearer token presented on WebSocket upgrade.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// The authenticated user, or `None` for an unknown/expired token.
    async fn validate(&self, token: &str) -> Result<Option<Uuid>>;
}
