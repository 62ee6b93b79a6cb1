//! Notebook repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use quire_core::{
    new_v7, CreateNotebookRequest, EntityType, Error, Notebook, NotebookRepository, Operation,
    Result, UpdateNotebookRequest,
};

use crate::outbox::{EventWriter, PgEventSink};

fn notebook_from_row(row: &PgRow) -> Notebook {
    Notebook {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// PostgreSQL implementation of NotebookRepository.
#[derive(Clone)]
pub struct PgNotebookRepository {
    pool: Pool<Postgres>,
}

impl PgNotebookRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotebookRepository for PgNotebookRepository {
    async fn create(&self, actor_id: &str, req: CreateNotebookRequest) -> Result<Notebook> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidInput("notebook name must not be empty".into()));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "INSERT INTO notebook (id, owner_id, name, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             RETURNING id, owner_id, name, created_at, updated_at",
        )
        .bind(new_v7())
        .bind(req.owner_id)
        .bind(&req.name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let notebook = notebook_from_row(&row);

        // Owners get an explicit membership row so access checks stay uniform.
        sqlx::query(
            "INSERT INTO resource_member (user_id, resource_type, resource_id, role)
             VALUES ($1, 'notebook', $2, 'owner')
             ON CONFLICT DO NOTHING",
        )
        .bind(notebook.owner_id)
        .bind(notebook.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Notebook,
            Operation::Create,
            actor_id,
            notebook.id,
            &notebook,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(notebook)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notebook>> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, created_at, updated_at FROM notebook WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(notebook_from_row))
    }

    async fn update(
        &self,
        actor_id: &str,
        id: Uuid,
        req: UpdateNotebookRequest,
    ) -> Result<Notebook> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "UPDATE notebook
             SET name = COALESCE($2, name), updated_at = $3
             WHERE id = $1
             RETURNING id, owner_id, name, created_at, updated_at",
        )
        .bind(id)
        .bind(req.name.as_deref())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("notebook {id}")))?;
        let notebook = notebook_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Notebook,
            Operation::Update,
            actor_id,
            id,
            &notebook,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(notebook)
    }

    async fn delete(&self, actor_id: &str, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "DELETE FROM notebook WHERE id = $1
             RETURNING id, owner_id, name, created_at, updated_at",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("notebook {id}")))?;
        let notebook = notebook_from_row(&row);

        EventWriter::record(
            &mut PgEventSink(&mut *tx),
            EntityType::Notebook,
            Operation::Delete,
            actor_id,
            id,
            &notebook,
        )
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }
}
