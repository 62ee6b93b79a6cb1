//! # quire-broker
//!
//! Message broker client for the Quire synchronization core.
//!
//! - [`BrokerBackend`] / [`MessageSource`]: the transport seam, implemented by
//!   [`RedisBroker`] (Redis Streams) and [`MemoryBroker`] (in-process)
//! - [`Producer`]: keyed publish, synchronous or fire-and-forget
//! - [`Consumer`]: consumer-group reader with bounded reconnects and a bounded
//!   hand-off channel
//! - [`ConsumerRegistry`]: one consumer per `(group, topic set)`

pub mod backend;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;
pub mod registry;
pub mod streams;

pub use backend::{BrokerBackend, MessageSource, ReadOptions};
pub use config::{BrokerConfig, ConsumerConfig};
pub use consumer::{Consumer, ConsumerState, MessageStream};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use message::BrokerMessage;
pub use producer::{Producer, PublishMode};
pub use registry::{topic_set_key, ConsumerRegistry};
pub use streams::RedisBroker;
