//! In-memory store implementing every repository trait.
//!
//! Used by the worker crates' tests and by `memory://` deployments. A
//! [`MemoryTransaction`] holds the store lock for its whole lifetime and works
//! on a copy of the state: `commit` swaps the copy in, dropping it discards
//! every staged change (entity writes and outbox events alike).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use quire_core::{
    new_v7, task_update_event_name, AccessControl, Block, BlockRepository, CreateBlockRequest,
    CreateNoteRequest, CreateNotebookRequest, CreateTaskRequest, EntityType, Error, Event,
    EventSink, EventStatus, Note, NoteRepository, Notebook, NotebookRepository, Operation,
    OutboxRepository, Result, Role, SyncAppliedPayload, SyncFields, SyncOutcome, Task,
    TaskRepository, TokenValidator, UpdateBlockRequest, UpdateNoteRequest,
    UpdateNotebookRequest, UpdateTaskRequest, SYNC_APPLIED_EVENT,
};

use crate::outbox::EventWriter;

/// Everything the in-memory store holds.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub notebooks: HashMap<Uuid, Notebook>,
    pub notes: HashMap<Uuid, Note>,
    pub blocks: HashMap<Uuid, Block>,
    pub tasks: HashMap<Uuid, Task>,
    pub events: Vec<Event>,
}

/// Shared handle to the in-memory state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction. Blocks until any other transaction finishes.
    pub async fn begin(&self) -> MemoryTransaction {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        MemoryTransaction { guard, working }
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// All committed outbox events in insertion order.
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub fn notebooks(&self) -> MemoryNotebookRepository {
        MemoryNotebookRepository(self.clone())
    }

    pub fn notes(&self) -> MemoryNoteRepository {
        MemoryNoteRepository(self.clone())
    }

    pub fn blocks(&self) -> MemoryBlockRepository {
        MemoryBlockRepository(self.clone())
    }

    pub fn tasks(&self) -> MemoryTaskRepository {
        MemoryTaskRepository(self.clone())
    }

    pub fn outbox(&self) -> MemoryOutboxRepository {
        MemoryOutboxRepository(self.clone())
    }
}

/// Staged changes against a [`MemoryStore`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTransaction {
    pub fn state(&self) -> &MemoryState {
        &self.working
    }

    pub fn state_mut(&mut self) -> &mut MemoryState {
        &mut self.working
    }

    pub fn commit(self) {
        let MemoryTransaction { mut guard, working } = self;
        *guard = working;
    }
}

#[async_trait]
impl EventSink for MemoryTransaction {
    async fn append_event(&mut self, event: &Event) -> Result<()> {
        self.working.events.push(event.clone());
        Ok(())
    }
}

// =============================================================================
// OUTBOX
// =============================================================================

#[derive(Clone)]
pub struct MemoryOutboxRepository(MemoryStore);

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<Event>> {
        let state = self.0.state.lock().await;
        let mut pending: Vec<Event> = state
            .events
            .iter()
            .filter(|e| !e.dispatched)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.0.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("outbox event {id}")))?;
        event.dispatched = true;
        event.status = EventStatus::Dispatched;
        event.dispatched_at = Some(at);
        event.attempts += 1;
        event.last_error = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.0.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id && !e.dispatched)
            .ok_or_else(|| Error::NotFound(format!("pending outbox event {id}")))?;
        event.status = EventStatus::Failed;
        event.attempts += 1;
        event.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let state = self.0.state.lock().await;
        Ok(state.events.iter().find(|e| e.id == id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        let state = self.0.state.lock().await;
        Ok(state.events.iter().filter(|e| !e.dispatched).count() as i64)
    }

    async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Event>> {
        let state = self.0.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// NOTEBOOKS / NOTES
// =============================================================================

#[derive(Clone)]
pub struct MemoryNotebookRepository(MemoryStore);

#[async_trait]
impl NotebookRepository for MemoryNotebookRepository {
    async fn create(&self, actor_id: &str, req: CreateNotebookRequest) -> Result<Notebook> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("notebook name must not be empty".into()));
        }
        let now = Utc::now();
        let notebook = Notebook {
            id: new_v7(),
            owner_id: req.owner_id,
            name: req.name,
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.0.begin().await;
        tx.state_mut().notebooks.insert(notebook.id, notebook.clone());
        EventWriter::record(
            &mut tx,
            EntityType::Notebook,
            Operation::Create,
            actor_id,
            notebook.id,
            &notebook,
        )
        .await?;
        tx.commit();
        Ok(notebook)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notebook>> {
        Ok(self.0.state.lock().await.notebooks.get(&id).cloned())
    }

    async fn update(
        &self,
        actor_id: &str,
        id: Uuid,
        req: UpdateNotebookRequest,
    ) -> Result<Notebook> {
        let mut tx = self.0.begin().await;
        let notebook = {
            let notebook = tx
                .state_mut()
                .notebooks
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("notebook {id}")))?;
            if let Some(name) = req.name {
                notebook.name = name;
            }
            notebook.updated_at = Utc::now();
            notebook.clone()
        };
        EventWriter::record(
            &mut tx,
            EntityType::Notebook,
            Operation::Update,
            actor_id,
            id,
            &notebook,
        )
        .await?;
        tx.commit();
        Ok(notebook)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.0.begin().await;
        let notebook = tx
            .state_mut()
            .notebooks
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("notebook {id}")))?;
        for note in tx.state_mut().notes.values_mut() {
            if note.notebook_id == Some(id) {
                note.notebook_id = None;
            }
        }
        EventWriter::record(
            &mut tx,
            EntityType::Notebook,
            Operation::Delete,
            actor_id,
            id,
            &notebook,
        )
        .await?;
        tx.commit();
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryNoteRepository(MemoryStore);

#[async_trait]
impl NoteRepository for MemoryNoteRepository {
    async fn create(&self, actor_id: &str, req: CreateNoteRequest) -> Result<Note> {
        let now = Utc::now();
        let note = Note {
            id: new_v7(),
            notebook_id: req.notebook_id,
            title: req.title,
            content: req.content,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.0.begin().await;
        if let Some(nb) = note.notebook_id {
            if !tx.state().notebooks.contains_key(&nb) {
                return Err(Error::InvalidInput(format!("notebook {nb} does not exist")));
            }
        }
        tx.state_mut().notes.insert(note.id, note.clone());
        EventWriter::record(
            &mut tx,
            EntityType::Note,
            Operation::Create,
            actor_id,
            note.id,
            &note,
        )
        .await?;
        tx.commit();
        Ok(note)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Note>> {
        Ok(self.0.state.lock().await.notes.get(&id).cloned())
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateNoteRequest) -> Result<Note> {
        let mut tx = self.0.begin().await;
        let note = {
            let note = tx
                .state_mut()
                .notes
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("note {id}")))?;
            if let Some(title) = req.title {
                note.title = title;
            }
            if let Some(content) = req.content {
                note.content = content;
            }
            if let Some(notebook_id) = req.notebook_id {
                note.notebook_id = notebook_id;
            }
            note.updated_at = Utc::now();
            note.clone()
        };
        EventWriter::record(
            &mut tx,
            EntityType::Note,
            Operation::Update,
            actor_id,
            id,
            &note,
        )
        .await?;
        tx.commit();
        Ok(note)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.0.begin().await;
        let note = tx
            .state_mut()
            .notes
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("note {id}")))?;
        let state = tx.state_mut();
        state.blocks.retain(|_, b| b.note_id != id);
        for task in state.tasks.values_mut() {
            if task.note_id == Some(id) {
                task.note_id = None;
            }
        }
        EventWriter::record(
            &mut tx,
            EntityType::Note,
            Operation::Delete,
            actor_id,
            id,
            &note,
        )
        .await?;
        tx.commit();
        Ok(())
    }
}

// =============================================================================
// BLOCKS / TASKS
// =============================================================================

#[derive(Clone)]
pub struct MemoryBlockRepository(MemoryStore);

#[async_trait]
impl BlockRepository for MemoryBlockRepository {
    async fn create(&self, actor_id: &str, req: CreateBlockRequest) -> Result<Block> {
        let now = Utc::now();
        let block = Block {
            id: new_v7(),
            note_id: req.note_id,
            block_type: req.block_type,
            content: req.content,
            metadata: if req.metadata.is_null() {
                json!({})
            } else {
                req.metadata
            },
            task_id: req.task_id,
            position: req.position,
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.0.begin().await;
        if !tx.state().notes.contains_key(&block.note_id) {
            return Err(Error::InvalidInput(format!(
                "note {} does not exist",
                block.note_id
            )));
        }
        tx.state_mut().blocks.insert(block.id, block.clone());
        EventWriter::record(
            &mut tx,
            EntityType::Block,
            Operation::Create,
            actor_id,
            block.id,
            &block,
        )
        .await?;
        tx.commit();
        Ok(block)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Block>> {
        Ok(self.0.state.lock().await.blocks.get(&id).cloned())
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateBlockRequest) -> Result<Block> {
        let mut tx = self.0.begin().await;
        let block = {
            let block = tx
                .state_mut()
                .blocks
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("block {id}")))?;
            if let Some(content) = req.content {
                block.content = content;
            }
            if let Some(metadata) = req.metadata {
                block.metadata = metadata;
            }
            if let Some(task_id) = req.task_id {
                block.task_id = task_id;
            }
            if let Some(position) = req.position {
                block.position = position;
            }
            block.updated_at = Utc::now();
            block.clone()
        };
        EventWriter::record(
            &mut tx,
            EntityType::Block,
            Operation::Update,
            actor_id,
            id,
            &block,
        )
        .await?;
        tx.commit();
        Ok(block)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.0.begin().await;
        let block = tx
            .state_mut()
            .blocks
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("block {id}")))?;
        EventWriter::record(
            &mut tx,
            EntityType::Block,
            Operation::Delete,
            actor_id,
            id,
            &block,
        )
        .await?;
        tx.commit();
        Ok(())
    }

    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<Block>> {
        let state = self.0.state.lock().await;
        Ok(state
            .blocks
            .values()
            .filter(|b| b.task_id == Some(task_id) && b.is_task_backed())
            .min_by_key(|b| (b.created_at, b.id))
            .cloned())
    }

    async fn apply_sync(
        &self,
        actor_id: &str,
        block_id: Uuid,
        source_task_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome> {
        let mut tx = self.0.begin().await;
        let Some(current) = tx.state().blocks.get(&block_id).cloned() else {
            return Ok(SyncOutcome::Skipped(format!("block {block_id} not found")));
        };
        if current.task_id != Some(source_task_id) || !current.is_task_backed() {
            return Ok(SyncOutcome::Skipped(format!(
                "block {block_id} is no longer linked to task {source_task_id}"
            )));
        }
        if current.sync_fields() == *fields {
            return Ok(SyncOutcome::Unchanged);
        }

        let mut block = current;
        block.set_sync_fields(fields);
        block.updated_at = Utc::now();
        tx.state_mut().blocks.insert(block_id, block.clone());

        let event = EventWriter::record(
            &mut tx,
            EntityType::Block,
            Operation::Update,
            actor_id,
            block_id,
            &block,
        )
        .await?;
        EventWriter::record_named(
            &mut tx,
            SYNC_APPLIED_EVENT,
            EntityType::Sync,
            Operation::Update,
            actor_id,
            block_id,
            &SyncAppliedPayload {
                source_type: EntityType::Task,
                source_id: source_task_id,
                target_type: EntityType::Block,
                target_id: block_id,
                title: fields.title.clone(),
                completed: fields.completed,
            },
        )
        .await?;
        tx.commit();
        Ok(SyncOutcome::Applied { event_id: event.id })
    }
}

#[derive(Clone)]
pub struct MemoryTaskRepository(MemoryStore);

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, actor_id: &str, req: CreateTaskRequest) -> Result<Task> {
        if req.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title must not be empty".into()));
        }
        let now = Utc::now();
        let task = Task {
            id: new_v7(),
            note_id: req.note_id,
            title: req.title,
            completed: req.completed,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.0.begin().await;
        tx.state_mut().tasks.insert(task.id, task.clone());
        EventWriter::record(
            &mut tx,
            EntityType::Task,
            Operation::Create,
            actor_id,
            task.id,
            &task,
        )
        .await?;
        tx.commit();
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.0.state.lock().await.tasks.get(&id).cloned())
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateTaskRequest) -> Result<Task> {
        let mut tx = self.0.begin().await;
        let before = tx
            .state()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let mut task = before.clone();
        if let Some(title) = req.title {
            task.title = title;
        }
        if let Some(completed) = req.completed {
            task.completed = completed;
        }
        task.updated_at = Utc::now();
        tx.state_mut().tasks.insert(id, task.clone());

        EventWriter::record_named(
            &mut tx,
            task_update_event_name(&before, &task),
            EntityType::Task,
            Operation::Update,
            actor_id,
            id,
            &task,
        )
        .await?;
        tx.commit();
        Ok(task)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.0.begin().await;
        let task = tx
            .state_mut()
            .tasks
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        for block in tx.state_mut().blocks.values_mut() {
            if block.task_id == Some(id) {
                block.task_id = None;
            }
        }
        EventWriter::record(
            &mut tx,
            EntityType::Task,
            Operation::Delete,
            actor_id,
            id,
            &task,
        )
        .await?;
        tx.commit();
        Ok(())
    }

    async fn apply_sync(
        &self,
        actor_id: &str,
        task_id: Uuid,
        source_block_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome> {
        let mut tx = self.0.begin().await;
        let Some(before) = tx.state().tasks.get(&task_id).cloned() else {
            return Ok(SyncOutcome::Skipped(format!("task {task_id} not found")));
        };
        if before.sync_fields() == *fields {
            return Ok(SyncOutcome::Unchanged);
        }

        let mut task = before.clone();
        task.title = fields.title.clone();
        task.completed = fields.completed;
        task.updated_at = Utc::now();
        tx.state_mut().tasks.insert(task_id, task.clone());

        let event = EventWriter::record_named(
            &mut tx,
            task_update_event_name(&before, &task),
            EntityType::Task,
            Operation::Update,
            actor_id,
            task_id,
            &task,
        )
        .await?;
        EventWriter::record_named(
            &mut tx,
            SYNC_APPLIED_EVENT,
            EntityType::Sync,
            Operation::Update,
            actor_id,
            task_id,
            &SyncAppliedPayload {
                source_type: EntityType::Block,
                source_id: source_block_id,
                target_type: EntityType::Task,
                target_id: task_id,
                title: fields.title.clone(),
                completed: fields.completed,
            },
        )
        .await?;
        tx.commit();
        Ok(SyncOutcome::Applied { event_id: event.id })
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Explicit role grants, checked by exact resource.
#[derive(Clone, Default)]
pub struct MemoryAccessControl {
    grants: Arc<RwLock<HashMap<(Uuid, EntityType, Uuid), Role>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(
        &self,
        user_id: Uuid,
        resource_type: EntityType,
        resource_id: Uuid,
        role: Role,
    ) {
        self.grants
            .write()
            .await
            .insert((user_id, resource_type, resource_id), role);
    }

    pub async fn revoke(&self, user_id: Uuid, resource_type: EntityType, resource_id: Uuid) {
        self.grants
            .write()
            .await
            .remove(&(user_id, resource_type, resource_id));
    }

    /// Make every subsequent check return an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccessControl for MemoryAccessControl {
    async fn has_access(
        &self,
        user_id: Uuid,
        resource_id: Uuid,
        resource_type: EntityType,
        minimum_role: Role,
    ) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("access control unavailable".to_string()));
        }
        let grants = self.grants.read().await;
        Ok(grants
            .get(&(user_id, resource_type, resource_id))
            .is_some_and(|role| role.satisfies(minimum_role)))
    }
}

/// Fixed token → user table.
#[derive(Clone, Default)]
pub struct MemoryTokenValidator {
    tokens: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl MemoryTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(&self, token: impl Into<String>, user_id: Uuid) {
        self.tokens.write().await.insert(token.into(), user_id);
    }
}

#[async_trait]
impl TokenValidator for MemoryTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<Uuid>> {
        Ok(self.tokens.read().await.get(token).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_everything() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await;
            let task = Task {
                id: new_v7(),
                note_id: None,
                title: "Draft".to_string(),
                completed: false,
                created_by: user(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            tx.state_mut().tasks.insert(task.id, task.clone());
            EventWriter::record(&mut tx, EntityType::Task, Operation::Create, "u", task.id, &task)
                .await
                .unwrap();
        }
        let state = store.snapshot().await;
        assert!(state.tasks.is_empty());
        assert!(state.events.is_empty());
    }

    #[tokio::test]
    async fn test_task_update_names_completion() {
        let store = MemoryStore::new();
        let tasks = store.tasks();
        let task = tasks
            .create(
                "u",
                CreateTaskRequest {
                    note_id: None,
                    title: "Ship".to_string(),
                    completed: false,
                    created_by: user(),
                },
            )
            .await
            .unwrap();
        tasks
            .update(
                "u",
                task.id,
                UpdateTaskRequest {
                    completed: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tasks
            .update(
                "u",
                task.id,
                UpdateTaskRequest {
                    title: Some("Ship v2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let names: Vec<String> = store.events().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["task.created", "task.completed", "task.updated"]);
    }

    #[tokio::test]
    async fn test_access_control_grants_by_role() {
        let acl = MemoryAccessControl::new();
        let (u, note) = (user(), Uuid::new_v4());
        acl.grant(u, EntityType::Note, note, Role::Viewer).await;

        assert!(acl.has_access(u, note, EntityType::Note, Role::Viewer).await.unwrap());
        assert!(!acl.has_access(u, note, EntityType::Note, Role::Editor).await.unwrap());
        assert!(!acl.has_access(u, note, EntityType::Task, Role::Viewer).await.unwrap());

        acl.set_failing(true);
        assert!(acl.has_access(u, note, EntityType::Note, Role::Viewer).await.is_err());
    }
}
