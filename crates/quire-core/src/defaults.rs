//! Centralized default constants for the Quire synchronization core.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs in every crate reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// OUTBOX DISPATCH
// =============================================================================

/// Interval between outbox polls in milliseconds.
///
/// Worst-case latency from commit to publish equals one interval.
pub const OUTBOX_POLL_INTERVAL_MS: u64 = 1000;

/// Maximum number of pending events fetched per tick.
pub const OUTBOX_BATCH_SIZE: i64 = 100;

/// Current payload schema version written into every event.
pub const EVENT_SCHEMA_VERSION: i32 = 1;

// =============================================================================
// BROKER CONSUMER
// =============================================================================

/// Capacity of the bounded channel between a consumer read loop and its readers.
pub const CONSUMER_CHANNEL_CAPACITY: usize = 256;

/// How long a full consumer channel is waited on before the message is dropped.
pub const CONSUMER_SEND_TIMEOUT_MS: u64 = 100;

/// Reconnect attempts after a failed connection before the consumer goes idle.
pub const CONSUMER_MAX_RETRIES: u32 = 5;

/// Fixed delay between reconnect attempts.
pub const CONSUMER_RETRY_INTERVAL_MS: u64 = 5000;

/// Broker-side block time for a single read.
pub const CONSUMER_BLOCK_MS: u64 = 1000;

/// Maximum number of messages read per poll.
pub const CONSUMER_BATCH_SIZE: usize = 64;

/// Consumer group member name suffix when neither `CONSUMER_MEMBER_ID` nor
/// `HOSTNAME` is set.
pub const CONSUMER_MEMBER_ID: &str = "quire";

/// Default Redis URL for the broker.
pub const BROKER_URL: &str = "redis://localhost:6379";

// =============================================================================
// REALTIME FANOUT
// =============================================================================

/// Capacity of each WebSocket connection's outbound channel.
pub const FANOUT_OUTBOUND_CAPACITY: usize = 64;

/// Maximum wait when a connection's outbound channel is full.
pub const FANOUT_SEND_TIMEOUT_MS: u64 = 250;

/// Maximum subscriptions a single connection may hold.
pub const FANOUT_MAX_SUBSCRIPTIONS: usize = 256;

/// WebSocket ping interval in seconds.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// CONSUMER GROUPS
// =============================================================================

/// Consumer group used by the realtime fanout service.
pub const FANOUT_GROUP_ID: &str = "realtime-fanout";

/// Consumer group used by the cross-entity sync service.
pub const SYNC_GROUP_ID: &str = "cross-entity-sync";

/// Actor id recorded on compensating writes made by the sync service.
pub const SYNC_ACTOR_ID: &str = "system:sync";

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;
