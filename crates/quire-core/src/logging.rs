//! Structured logging schema and field name constants for Quire.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query by the same keys across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (messages, deliveries) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "broker", "outbox", "fanout", "sync"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "producer", "consumer", "dispatcher", "registry"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "publish", "poll", "deliver", "apply_sync"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Outbox event UUID.
pub const EVENT_ID: &str = "event_id";

/// Event name, e.g. `note.created`.
pub const EVENT_NAME: &str = "event";

/// Entity UUID the event describes.
pub const ENTITY_ID: &str = "entity_id";

/// Broker topic.
pub const TOPIC: &str = "topic";

/// Consumer group id.
pub const GROUP_ID: &str = "group_id";

/// WebSocket connection id.
pub const CONNECTION_ID: &str = "connection_id";

/// Authenticated user id.
pub const USER_ID: &str = "user_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of items in a batch.
pub const BATCH_SIZE: &str = "batch_size";

/// Reconnect attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
