//! Cross-entity sync between tasks and their task blocks.
//!
//! Handles `block-events` and `task-events`. The handler always reads the
//! source entity's current state rather than the event payload, then asks
//! the target repository to apply the fields. The repository compares under
//! a row lock and writes nothing when the fields already match.
//!
//! Events written by sync itself (actor [`SyncConfig::actor_id`]) are
//! skipped: a task → block write never comes back as block → task, even when
//! the task has been edited again before the echo is consumed.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quire_broker::{BrokerMessage, MessageStream};
use quire_core::{
    defaults, BlockRepository, EntityType, Event, Operation, Result, SyncOutcome, TaskRepository,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Actor recorded on events written by sync.
    pub actor_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            actor_id: defaults::SYNC_ACTOR_ID.to_string(),
        }
    }
}

impl SyncConfig {
    /// Reads `SYNC_ENABLED` (default `true`).
    pub fn from_env() -> Self {
        let enabled = std::env::var("SYNC_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub handled: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub errors: u64,
}

pub struct CrossEntitySyncService {
    blocks: Arc<dyn BlockRepository>,
    tasks: Arc<dyn TaskRepository>,
    config: SyncConfig,
    stats: watch::Sender<SyncStats>,
}

impl CrossEntitySyncService {
    pub fn new(
        blocks: Arc<dyn BlockRepository>,
        tasks: Arc<dyn TaskRepository>,
        config: SyncConfig,
    ) -> Self {
        let (stats, _) = watch::channel(SyncStats::default());
        Self {
            blocks,
            tasks,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<SyncStats> {
        self.stats.subscribe()
    }

    /// Decode a broker message and handle it.
    pub async fn handle_message(&self, message: &BrokerMessage) -> Result<SyncOutcome> {
        let event = Event::from_wire(&message.value)?;
        self.handle_event(&event).await
    }

    pub async fn handle_event(&self, event: &Event) -> Result<SyncOutcome> {
        let result = self.dispatch(event).await;

        self.stats.send_modify(|stats| {
            stats.handled += 1;
            match &result {
                Ok(SyncOutcome::Applied { .. }) => stats.applied += 1,
                Ok(SyncOutcome::Unchanged) => stats.unchanged += 1,
                Ok(SyncOutcome::Skipped(_)) => stats.skipped += 1,
                Err(_) => stats.errors += 1,
            }
        });

        match &result {
            Ok(SyncOutcome::Applied { event_id }) => info!(
                subsystem = "sync",
                component = "task_sync",
                event_id = %event.id,
                event = %event.name,
                entity_id = %event.entity_id,
                applied_event_id = %event_id,
                "Sync applied"
            ),
            Ok(outcome) => debug!(
                subsystem = "sync",
                component = "task_sync",
                event_id = %event.id,
                event = %event.name,
                outcome = ?outcome,
                "Sync not applied"
            ),
            Err(_) => {}
        }
        result
    }

    async fn dispatch(&self, event: &Event) -> Result<SyncOutcome> {
        if !self.config.enabled {
            return Ok(SyncOutcome::Skipped("sync disabled".to_string()));
        }
        if event.operation == Operation::Delete {
            return Ok(SyncOutcome::Skipped("delete events are not synced".to_string()));
        }
        if event.actor_id == self.config.actor_id {
            return Ok(SyncOutcome::Skipped("event written by sync".to_string()));
        }
        match event.entity {
            EntityType::Block => self.block_to_task(event.entity_id).await,
            EntityType::Task => self.task_to_block(event.entity_id).await,
            other => Ok(SyncOutcome::Skipped(format!("{other} events are not synced"))),
        }
    }

    async fn block_to_task(&self, block_id: Uuid) -> Result<SyncOutcome> {
        let Some(block) = self.blocks.get(block_id).await? else {
            return Ok(SyncOutcome::Skipped("block no longer exists".to_string()));
        };
        let Some(task_id) = block.task_id.filter(|_| block.is_task_backed()) else {
            return Ok(SyncOutcome::Skipped("block is not task-backed".to_string()));
        };
        self.tasks
            .apply_sync(&self.config.actor_id, task_id, block.id, &block.sync_fields())
            .await
    }

    async fn task_to_block(&self, task_id: Uuid) -> Result<SyncOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(SyncOutcome::Skipped("task no longer exists".to_string()));
        };
        let Some(block) = self.blocks.find_by_task(task.id).await? else {
            return Ok(SyncOutcome::Skipped("task has no linked block".to_string()));
        };
        self.blocks
            .apply_sync(&self.config.actor_id, block.id, task.id, &task.sync_fields())
            .await
    }

    /// Handle every message from `stream` until it ends.
    ///
    /// Failures are logged; the message has already been acknowledged to the
    /// broker and is not retried.
    pub async fn run(self: Arc<Self>, stream: MessageStream) {
        info!(
            subsystem = "sync",
            component = "task_sync",
            enabled = self.config.enabled,
            "Cross-entity sync loop started"
        );
        while let Some(message) = stream.recv().await {
            if let Err(e) = self.handle_message(&message).await {
                warn!(
                    subsystem = "sync",
                    component = "task_sync",
                    topic = %message.topic,
                    key = %message.key,
                    error = %e,
                    "Sync failed"
                );
            }
        }
        info!(
            subsystem = "sync",
            component = "task_sync",
            "Cross-entity sync loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{BlockType, NoteRepository};
    use quire_db::test_fixtures::{note_request, task_block_request, task_request};
    use quire_db::MemoryStore;
    use serde_json::json;

    fn service(store: &MemoryStore) -> CrossEntitySyncService {
        CrossEntitySyncService::new(
            Arc::new(store.blocks()),
            Arc::new(store.tasks()),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_delete_events_are_skipped() {
        let store = MemoryStore::new();
        let event = Event::pending(
            EntityType::Task,
            Operation::Delete,
            "u",
            Uuid::new_v4(),
            &json!({}),
        )
        .unwrap();
        let outcome = service(&store).handle_event(&event).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_non_task_block_is_skipped() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let task = store
            .tasks()
            .create("u", task_request(user, None, "Water plants"))
            .await
            .unwrap();
        let note = store
            .notes()
            .create("u", note_request(user, "Chores"))
            .await
            .unwrap();
        let mut req = task_block_request(note.id, task.id, "Water plants");
        req.block_type = BlockType::Text;
        let block = store.blocks().create("u", req).await.unwrap();

        let event =
            Event::pending(EntityType::Block, Operation::Update, "u", block.id, &json!({}))
                .unwrap();
        let outcome = service(&store).handle_event(&event).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Skipped("block is not task-backed".to_string())
        );
    }

    #[tokio::test]
    async fn test_disabled_skips_everything() {
        let store = MemoryStore::new();
        let svc = CrossEntitySyncService::new(
            Arc::new(store.blocks()),
            Arc::new(store.tasks()),
            SyncConfig::default().with_enabled(false),
        );
        let event = Event::pending(
            EntityType::Task,
            Operation::Update,
            "u",
            Uuid::new_v4(),
            &json!({}),
        )
        .unwrap();
        assert!(matches!(
            svc.handle_event(&event).await.unwrap(),
            SyncOutcome::Skipped(_)
        ));
        assert_eq!(svc.stats().skipped, 1);
    }
}
