//! Broker backend abstraction.

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::BrokerMessage;

/// A broker the producer publishes to and consumers read from.
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    /// Append a message to its topic.
    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// Join `group_id` on every topic and return a reader.
    ///
    /// Groups that do not exist yet start at the current end of each topic.
    async fn connect(
        &self,
        topics: &[String],
        group_id: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn MessageSource>, BrokerError>;

    /// Round-trip to the broker.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// Reader bound to one consumer group.
#[async_trait]
pub trait MessageSource: Send {
    /// Next batch, waiting at most the configured block time.
    ///
    /// An empty batch means nothing arrived in time; an error means the
    /// connection is unusable and the caller should reconnect.
    async fn poll(&mut self) -> Result<Vec<BrokerMessage>, BrokerError>;

    /// Acknowledge messages returned by `poll`.
    async fn ack(&mut self, messages: &[BrokerMessage]) -> Result<(), BrokerError>;
}

/// Read tuning shared by all backends.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub block: std::time::Duration,
    pub batch_size: usize,
}
