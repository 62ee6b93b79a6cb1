//! Task repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use quire_core::{
    new_v7, task_update_event_name, CreateTaskRequest, EntityType, Error, Operation, Result,
    SyncAppliedPayload, SyncFields, SyncOutcome, Task, TaskRepository, UpdateTaskRequest,
    SYNC_APPLIED_EVENT,
};

use crate::outbox::{EventWriter, PgEventSink};

const TASK_COLUMNS: &str = "id, note_id, title, completed, created_by, created_at, updated_at";

fn task_from_row(row: &PgRow) -> Task {
    Task {
        id: row.get("id"),
        note_id: row.get("note_id"),
        title: row.get("title"),
        completed: row.get("completed"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// PostgreSQL implementation of TaskRepository.
#[derive(Clone)]
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
}

impl PgTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn write_fields(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        task: &Task,
    ) -> Result<()> {
        sqlx::query("UPDATE task SET title = $2, completed = $3, updated_at = $4 WHERE id = $1")
            .bind(task.id)
            .bind(&task.title)
            .bind(task.completed)
            .bind(task.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn lock(tx: &mut sqlx::Transaction<'_, Postgres>, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(task_from_row))
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn create(&self, actor_id: &str, req: CreateTaskRequest) -> Result<Task> {
        if req.title.trim().is_empty() {
            return Err(Error::InvalidInput("task title must not be empty".into()));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "INSERT INTO task (id, note_id, title, completed, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.note_id)
        .bind(&req.title)
        .bind(req.completed)
        .bind(req.created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let task = task_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Task,
            Operation::Create,
            actor_id,
            task.id,
            &task,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.as_ref().map(task_from_row))
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateTaskRequest) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let before = Self::lock(&mut tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let mut task = before.clone();
        if let Some(title) = req.title {
            task.title = title;
        }
        if let Some(completed) = req.completed {
            task.completed = completed;
        }
        task.updated_at = Utc::now();

        Self::write_fields(&mut tx, &task).await?;
        EventWriter::record_named(
            &mut PgEventSink(&mut *tx),
            task_update_event_name(&before, &task),
            EntityType::Task,
            Operation::Update,
            actor_id,
            id,
            &task,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(task)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!("DELETE FROM task WHERE id = $1 RETURNING {TASK_COLUMNS}"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let task = task_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Task,
            Operation::Delete,
            actor_id,
            id,
            &task,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn apply_sync(
        &self,
        actor_id: &str,
        task_id: Uuid,
        source_block_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let Some(before) = Self::lock(&mut tx, task_id).await? else {
            return Ok(SyncOutcome::Skipped(format!("task {task_id} not found")));
        };
        if before.sync_fields() == *fields {
            debug!(
                subsystem = "sync",
                component = "task_repository",
                op = "apply_sync",
                entity_id = %task_id,
                "Task already matches block; nothing written"
            );
            return Ok(SyncOutcome::Unchanged);
        }

        let mut task = before.clone();
        task.title = fields.title.clone();
        task.completed = fields.completed;
        task.updated_at = Utc::now();

        Self::write_fields(&mut tx, &task).await?;
        let event = EventWriter::record_named(
            &mut PgEventSink(&mut *tx),
            task_update_event_name(&before, &task),
            EntityType::Task,
            Operation::Update,
            actor_id,
            task_id,
            &task,
        )
        .await?;

        EventWriter::record_named(
            &mut PgEventSink(&mut *tx),
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

        tx.commit().await.map_err(Error::Database)?;
        Ok(SyncOutcome::Applied { event_id: event.id })
    }
}
