//! # quire-core
//!
//! Core types, traits, and abstractions for the Quire synchronization core.
//!
//! This crate provides the outbox event model, the realtime client protocol,
//! the entities kept in sync, and the traits every other crate implements or
//! consumes.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod messages;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{
    EntityType, Event, EventStatus, Operation, SyncAppliedPayload, ALL_TOPICS, BLOCK_TOPIC,
    NOTEBOOK_TOPIC, NOTE_TOPIC, SYNC_APPLIED_EVENT, SYNC_SERVICE_TOPICS, SYNC_TOPIC,
    TASK_COMPLETED_EVENT, TASK_TOPIC,
};
pub use messages::{
    AckMessage, ClientMessage, ErrorMessage, EventMessage, StandardMessage, Subscription,
    SubscriptionRequest,
};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
