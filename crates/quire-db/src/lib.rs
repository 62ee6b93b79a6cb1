//! # quire-db
//!
//! PostgreSQL persistence layer for the Quire synchronization core.
//!
//! This crate provides:
//! - Connection pool management
//! - The transactional outbox writer and the dispatcher-facing outbox repository
//! - Repository implementations for notebooks, notes, blocks and tasks
//! - Access control and WebSocket token validation
//! - An in-memory store implementing the same traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use quire_db::{Database, NoteRepository, CreateNoteRequest};
//!
//! let db = Database::connect("postgres://localhost/quire").await?;
//! let note = db.notes.create("user:42", CreateNoteRequest {
//!     notebook_id: None,
//!     title: "Hello".to_string(),
//!     content: String::new(),
//!     created_by: user_id,
//! }).await?;
//! // `note.created` is now pending in event_outbox.
//! ```
pub mod access;
pub mod blocks;
pub mod memory;
pub mod notebooks;
pub mod notes;
pub mod outbox;
pub mod pool;
pub mod tasks;

// Test fixtures for integration tests
pub mod test_fixtures;

// Re-export core types
pub use quire_core::*;

pub use access::{hash_token, PgAccessControl, PgTokenValidator};
pub use blocks::PgBlockRepository;
pub use memory::{
    MemoryAccessControl, MemoryBlockRepository, MemoryNoteRepository, MemoryNotebookRepository,
    MemoryOutboxRepository, MemoryState, MemoryStore, MemoryTaskRepository, MemoryTokenValidator,
    MemoryTransaction,
};
pub use notebooks::PgNotebookRepository;
pub use notes::PgNoteRepository;
pub use outbox::{EventWriter, PgEventSink, PgOutboxRepository};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use tasks::PgTaskRepository;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub notebooks: PgNotebookRepository,
    pub notes: PgNoteRepository,
    pub blocks: PgBlockRepository,
    pub tasks: PgTaskRepository,
    /// Outbox read/transition access for the dispatcher.
    pub outbox: PgOutboxRepository,
    pub access: PgAccessControl,
    pub tokens: PgTokenValidator,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            notebooks: PgNotebookRepository::new(pool.clone()),
            notes: PgNoteRepository::new(pool.clone()),
            blocks: PgBlockRepository::new(pool.clone()),
            tasks: PgTaskRepository::new(pool.clone()),
            outbox: PgOutboxRepository::new(pool.clone()),
            access: PgAccessControl::new(pool.clone()),
            tokens: PgTokenValidator::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Round-trip a trivial query; used by health checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
