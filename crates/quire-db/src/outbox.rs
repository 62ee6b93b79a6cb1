//! Transactional outbox: event writer and the dispatcher-facing repository.
//!
//! Repositories never publish to the broker. They call
//! [`EventWriter::record`] with the same transaction that carries the entity
//! mutation, so the event row exists if and only if the mutation committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use quire_core::{
    EntityType, Error, Event, EventSink, EventStatus, Operation, OutboxRepository, Result,
};

const EVENT_COLUMNS: &str = "id, name, version, entity, entity_id, operation, actor_id, \
     timestamp, payload, status, dispatched, dispatched_at, attempts, last_error";

/// Builds outbox events and appends them to a transaction.
pub struct EventWriter;

impl EventWriter {
    /// Record a standard `<entity>.<past-tense>` event.
    ///
    /// Serialization failures surface before anything is written; the caller
    /// drops its transaction and the mutation rolls back with it.
    pub async fn record<S, P>(
        sink: &mut S,
        entity: EntityType,
        operation: Operation,
        actor_id: &str,
        entity_id: Uuid,
        payload: &P,
    ) -> Result<Event>
    where
        S: EventSink + ?Sized,
        P: Serialize + Sync + ?Sized,
    {
        Self::record_named(
            sink,
            entity.event_name(operation),
            entity,
            operation,
            actor_id,
            entity_id,
            payload,
        )
        .await
    }

    /// Record an event with an explicit name such as `task.completed`.
    pub async fn record_named<S, P>(
        sink: &mut S,
        name: impl Into<String>,
        entity: EntityType,
        operation: Operation,
        actor_id: &str,
        entity_id: Uuid,
        payload: &P,
    ) -> Result<Event>
    where
        S: EventSink + ?Sized,
        P: Serialize + Sync + ?Sized,
    {
        let event = Event::pending_named(name, entity, operation, actor_id, entity_id, payload)?;
        sink.append_event(&event).await?;
        debug!(
            subsystem = "outbox",
            component = "writer",
            op = "record",
            event_id = %event.id,
            event = %event.name,
            entity_id = %event.entity_id,
            "Outbox event recorded"
        );
        Ok(event)
    }
}

pub(crate) async fn insert_event(conn: &mut PgConnection, event: &Event) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_outbox
            (id, name, version, entity, entity_id, operation, actor_id,
             timestamp, payload, status, dispatched, dispatched_at, attempts, last_error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(event.id)
    .bind(&event.name)
    .bind(event.version)
    .bind(event.entity.as_str())
    .bind(event.entity_id)
    .bind(event.operation.as_str())
    .bind(&event.actor_id)
    .bind(event.timestamp)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(event.dispatched)
    .bind(event.dispatched_at)
    .bind(event.attempts)
    .bind(&event.last_error)
    .execute(conn)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

/// [`EventSink`] over an open PostgreSQL transaction's connection.
///
/// Repositories wrap their transaction as `PgEventSink(&mut *tx)` so the
/// event insert runs inside it.
pub struct PgEventSink<'a>(pub &'a mut PgConnection);

#[async_trait]
impl<'a> EventSink for PgEventSink<'a> {
    async fn append_event(&mut self, event: &Event) -> Result<()> {
        insert_event(&mut *self.0, event).await
    }
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let entity: String = row.get("entity");
    let operation: String = row.get("operation");
    let status: String = row.get("status");
    Ok(Event {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        entity: entity.parse()?,
        entity_id: row.get("entity_id"),
        operation: operation.parse()?,
        actor_id: row.get("actor_id"),
        timestamp: row.get("timestamp"),
        payload: row.get("payload"),
        status: status.parse::<EventStatus>()?,
        dispatched: row.get("dispatched"),
        dispatched_at: row.get("dispatched_at"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
    })
}

/// PostgreSQL implementation of OutboxRepository.
#[derive(Clone)]
pub struct PgOutboxRepository {
    pool: Pool<Postgres>,
}

impl PgOutboxRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_outbox
             WHERE dispatched = false
             ORDER BY timestamp ASC, id ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE event_outbox
             SET dispatched = true, status = 'dispatched', dispatched_at = $2,
                 attempts = attempts + 1, last_error = NULL
             WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("outbox event {id}")));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE event_outbox
             SET status = 'failed', attempts = attempts + 1, last_error = $2
             WHERE id = $1 AND dispatched = false",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("pending outbox event {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE dispatched = false")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }

    async fn list_for_entity(&self, entity_id: Uuid) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_outbox
             WHERE entity_id = $1
             ORDER BY timestamp ASC, id ASC"
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(event_from_row).collect()
    }
}
