//! Note repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use quire_core::{
    new_v7, CreateNoteRequest, EntityType, Error, Note, NoteRepository, Operation, Result,
    UpdateNoteRequest,
};

use crate::outbox::{EventWriter, PgEventSink};

const NOTE_COLUMNS: &str = "id, notebook_id, title, content, created_by, created_at, updated_at";

fn note_from_row(row: &PgRow) -> Note {
    Note {
        id: row.get("id"),
        notebook_id: row.get("notebook_id"),
        title: row.get("title"),
        content: row.get("content"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// PostgreSQL implementation of NoteRepository.
#[derive(Clone)]
pub struct PgNoteRepository {
    pool: Pool<Postgres>,
}

impl PgNoteRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NoteRepository for PgNoteRepository {
    async fn create(&self, actor_id: &str, req: CreateNoteRequest) -> Result<Note> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "INSERT INTO note (id, notebook_id, title, content, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {NOTE_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.notebook_id)
        .bind(&req.title)
        .bind(&req.content)
        .bind(req.created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let note = note_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Note,
            Operation::Create,
            actor_id,
            note.id,
            &note,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(note)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Note>> {
        let row = sqlx::query(&format!("SELECT {NOTE_COLUMNS} FROM note WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.as_ref().map(note_from_row))
    }

    async fn update(&self, actor_id: &str, id: Uuid, req: UpdateNoteRequest) -> Result<Note> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM note WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("note {id}")))?;
        let mut note = note_from_row(&current);

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

        sqlx::query(
            "UPDATE note SET title = $2, content = $3, notebook_id = $4, updated_at = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(&note.title)
        .bind(&note.content)
        .bind(note.notebook_id)
        .bind(note.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Note,
            Operation::Update,
            actor_id,
            id,
            &note,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(note)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!("DELETE FROM note WHERE id = $1 RETURNING {NOTE_COLUMNS}"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("note {id}")))?;
        let note = note_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Note,
            Operation::Delete,
            actor_id,
            id,
            &note,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }
}
