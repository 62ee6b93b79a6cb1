//! Block repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use quire_core::{
    new_v7, Block, BlockRepository, BlockType, CreateBlockRequest, EntityType, Error, Operation,
    Result, SyncAppliedPayload, SyncFields, SYNC_APPLIED_EVENT, SyncOutcome, UpdateBlockRequest,
};

use crate::outbox::{EventWriter, PgEventSink};

const BLOCK_COLUMNS: &str =
    "id, note_id, block_type, content, metadata, task_id, position, created_at, updated_at";

fn block_from_row(row: &PgRow) -> Result<Block> {
    let block_type: String = row.get("block_type");
    Ok(Block {
        id: row.get("id"),
        note_id: row.get("note_id"),
        block_type: block_type.parse::<BlockType>()?,
        content: row.get("content"),
        metadata: row.get("metadata"),
        task_id: row.get("task_id"),
        position: row.get("position"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// PostgreSQL implementation of BlockRepository.
#[derive(Clone)]
pub struct PgBlockRepository {
    pool: Pool<Postgres>,
}

impl PgBlockRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlockRepository for PgBlockRepository {
    async fn create(&self, actor_id: &str, req: CreateBlockRequest) -> Result<Block> {
        let now = Utc::now();
        let metadata = if req.metadata.is_null() {
            json!({})
        } else {
            req.metadata
        };
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "INSERT INTO block
                (id, note_id, block_type, content, metadata, task_id, position, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
             RETURNING {BLOCK_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.note_id)
        .bind(req.block_type.as_str())
        .bind(&req.content)
        .bind(&metadata)
        .bind(req.task_id)
        .bind(req.position)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let block = block_from_row(&row)?;

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Block,
            Operation::Create,
            actor_id,
            block.id,
            &block,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(block)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Block>> {
        let row = sqlx::query(&format!("SELECT {BLOCK_COLUMNS} FROM block WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateBlockRequest) -> Result<Block> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM block WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("block {id}")))?;
        let mut block = block_from_row(&current)?;

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

        sqlx::query(
            "UPDATE block
             SET content = $2, metadata = $3, task_id = $4, position = $5, updated_at = $6
             WHERE id = $1",
        )
        .bind(id)
        .bind(&block.content)
        .bind(&block.metadata)
        .bind(block.task_id)
        .bind(block.position)
        .bind(block.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Block,
            Operation::Update,
            actor_id,
            id,
            &block,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(block)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "DELETE FROM block WHERE id = $1 RETURNING {BLOCK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("block {id}")))?;
        let block = block_from_row(&row)?;

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Block,
            Operation::Delete,
            actor_id,
            id,
            &block,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<Block>> {
        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM block
             WHERE task_id = $1 AND block_type = 'task'
             ORDER BY created_at ASC, id ASC
             LIMIT 1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn apply_sync(
        &self,
        actor_id: &str,
        block_id: Uuid,
        source_task_id: Uuid,
        fields: &SyncFields,
    ) -> Result<SyncOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let Some(row) = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM block WHERE id = $1 FOR UPDATE"
        ))
        .bind(block_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        else {
            return Ok(SyncOutcome::Skipped(format!("block {block_id} not found")));
        };
        let mut block = block_from_row(&row)?;

        if block.task_id != Some(source_task_id) || !block.is_task_backed() {
            return Ok(SyncOutcome::Skipped(format!(
                "block {block_id} is no longer linked to task {source_task_id}"
            )));
        }
        if block.sync_fields() == *fields {
            debug!(
                subsystem = "sync",
                component = "block_repository",
                op = "apply_sync",
                entity_id = %block_id,
                "Block already matches task; nothing written"
            );
            return Ok(SyncOutcome::Unchanged);
        }

        block.set_sync_fields(fields);
        block.updated_at = Utc::now();

        sqlx::query("UPDATE block SET metadata = $2, updated_at = $3 WHERE id = $1")
            .bind(block_id)
            .bind(&block.metadata)
            .bind(block.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let event = EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Block,
            Operation::Update,
            actor_id,
            block_id,
            &block,
        )
        .await?;

        EventWriter::record_named(
            &mut PgEventSink(&mut *tx),
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

        tx.commit().await.map_err(Error::Database)?;
        Ok(SyncOutcome::Applied { event_id: event.id })
    }
}
