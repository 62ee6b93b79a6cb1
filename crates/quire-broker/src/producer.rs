//! Message producer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::BrokerBackend;
use crate::error::BrokerError;
use crate::message::BrokerMessage;

/// How `publish` waits for the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Wait for the broker to accept the message and report its error.
    #[default]
    Sync,
    /// Queue the message for a background publisher and return once queued.
    FireAndForget,
}

impl FromStr for PublishMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(PublishMode::Sync),
            "async" | "fire-and-forget" => Ok(PublishMode::FireAndForget),
            other => Err(BrokerError::Config(format!("unknown publish mode: {other}"))),
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishMode::Sync => f.write_str("sync"),
            PublishMode::FireAndForget => f.write_str("async"),
        }
    }
}

/// Queued fire-and-forget messages before `publish` waits for room.
const QUEUE_CAPACITY: usize = 1024;

/// Publishes to a broker backend.
///
/// Fire-and-forget messages go through a single background task, so they
/// reach the broker in the order `publish` was called.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn BrokerBackend>,
    mode: PublishMode,
    queue: Option<mpsc::Sender<BrokerMessage>>,
}

impl Producer {
    /// Must be called inside a tokio runtime when `mode` is
    /// [`PublishMode::FireAndForget`].
    pub fn new(backend: Arc<dyn BrokerBackend>, mode: PublishMode) -> Self {
        let queue = match mode {
            PublishMode::Sync => None,
            PublishMode::FireAndForget => {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                tokio::spawn(drain_queue(backend.clone(), rx));
                Some(tx)
            }
        };
        Self {
            backend,
            mode,
            queue,
        }
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Publish `value` to `topic` keyed by `key`.
    ///
    /// In fire-and-forget mode a broker failure is only logged.
    pub async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let message = BrokerMessage::new(topic, key, value);
        match &self.queue {
            None => {
                self.backend.publish(&message).await?;
                debug!(
                    subsystem = "broker",
                    component = "producer",
                    topic = %topic,
                    key = %key,
                    "Published"
                );
                Ok(())
            }
            Some(queue) => queue
                .send(message)
                .await
                .map_err(|_| BrokerError::Publish("publish queue closed".to_string())),
        }
    }
}

async fn drain_queue(backend: Arc<dyn BrokerBackend>, mut rx: mpsc::Receiver<BrokerMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = backend.publish(&message).await {
            warn!(
                subsystem = "broker",
                component = "producer",
                topic = %message.topic,
                key = %message.key,
                error = %e,
                "Fire-and-forget publish failed"
            );
        }
    }
    debug!(
        subsystem = "broker",
        component = "producer",
        "Publish queue closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MessageSource;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Publishes the first message slowly.
    struct SlowFirst {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl BrokerBackend for SlowFirst {
        async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
            if message.key == "k0" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.publish(message).await
        }

        async fn connect(
            &self,
            topics: &[String],
            group_id: &str,
            consumer_name: &str,
        ) -> Result<Box<dyn MessageSource>, BrokerError> {
            self.inner.connect(topics, group_id, consumer_name).await
        }

        async fn ping(&self) -> Result<(), BrokerError> {
            self.inner.ping().await
        }

        fn name(&self) -> &'static str {
            "slow-first"
        }
    }

    #[test]
    fn test_publish_mode_parse() {
        assert_eq!("sync".parse::<PublishMode>().unwrap(), PublishMode::Sync);
        assert_eq!(
            "async".parse::<PublishMode>().unwrap(),
            PublishMode::FireAndForget
        );
        assert!("eventually".parse::<PublishMode>().is_err());
    }

    #[tokio::test]
    async fn test_sync_publish_reports_failure() {
        let broker = MemoryBroker::default();
        let producer = Producer::new(Arc::new(broker.clone()), PublishMode::Sync);

        producer.publish("note-events", "n1", vec![1]).await.unwrap();
        assert_eq!(broker.published("note-events").await.len(), 1);

        broker.set_available(false);
        assert!(producer.publish("note-events", "n1", vec![2]).await.is_err());
    }

    #[tokio::test]
    async fn test_fire_and_forget_swallows_failure() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        let producer = Producer::new(Arc::new(broker), PublishMode::FireAndForget);
        assert!(producer.publish("note-events", "n1", vec![]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_keeps_publish_order() {
        let broker = MemoryBroker::default();
        let producer = Producer::new(
            Arc::new(SlowFirst {
                inner: broker.clone(),
            }),
            PublishMode::FireAndForget,
        );
        for key in ["k0", "k1", "k2"] {
            producer.publish("task-events", key, vec![]).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let keys: Vec<String> = broker
            .published("task-events")
            .await
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["k0", "k1", "k2"]);
    }
}
