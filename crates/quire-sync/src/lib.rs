//! # quire-sync
//!
//! Background workers of the Quire synchronization core.
//!
//! - [`EventDispatcher`]: polls the outbox and publishes pending events
//! - [`FanoutService`]: pushes events to authorized WebSocket subscribers
//! - [`CrossEntitySyncService`]: keeps tasks and task blocks consistent
//! - [`SyncRuntime`]: starts all of the above against one broker

pub mod dispatcher;
pub mod fanout;
pub mod runtime;
pub mod task_sync;

pub use dispatcher::{
    DispatcherConfig, DispatcherHandle, DispatcherStats, EventDispatcher, TickReport,
};
pub use fanout::{ConnectionId, FanoutConfig, FanoutReport, FanoutService};
pub use runtime::{RuntimeConfig, RuntimeStatus, SyncDeps, SyncRuntime};
pub use task_sync::{CrossEntitySyncService, SyncConfig, SyncStats};
