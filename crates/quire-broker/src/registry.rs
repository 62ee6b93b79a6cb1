//! Consumer registry: at most one live consumer per group and topic set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::BrokerBackend;
use crate::config::ConsumerConfig;
use crate::consumer::Consumer;

/// Sorted, de-duplicated, comma-joined topic list.
pub fn topic_set_key(topics: &[&str]) -> String {
    let mut sorted: Vec<&str> = topics.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

pub struct ConsumerRegistry {
    backend: Arc<dyn BrokerBackend>,
    config: ConsumerConfig,
    consumers: RwLock<HashMap<(String, String), Consumer>>,
}

impl ConsumerRegistry {
    pub fn new(backend: Arc<dyn BrokerBackend>, config: ConsumerConfig) -> Self {
        Self {
            backend,
            config,
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// The running consumer for `(group_id, topics)`, started on first use.
    ///
    /// A consumer that was closed directly is replaced.
    pub async fn get_or_start(&self, group_id: &str, topics: &[&str]) -> Consumer {
        let key = (group_id.to_string(), topic_set_key(topics));

        if let Some(existing) = self.consumers.read().await.get(&key) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let mut consumers = self.consumers.write().await;
        if let Some(existing) = consumers.get(&key) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        debug!(
            subsystem = "broker",
            component = "registry",
            group_id = %key.0,
            topics = %key.1,
            "Starting consumer"
        );
        let consumer = Consumer::start(self.backend.clone(), group_id, topics, self.config.clone());
        consumers.insert(key, consumer.clone());
        consumer
    }

    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }

    /// Close and forget every registered consumer.
    pub async fn close_all(&self) {
        let mut consumers = self.consumers.write().await;
        let count = consumers.len();
        for consumer in consumers.values() {
            consumer.close();
        }
        consumers.clear();
        info!(
            subsystem = "broker",
            component = "registry",
            closed = count,
            "All consumers closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_set_key_is_order_insensitive() {
        assert_eq!(
            topic_set_key(&["task-events", "block-events"]),
            topic_set_key(&["block-events", "task-events", "block-events"])
        );
        assert_eq!(topic_set_key(&["b", "a"]), "a,b");
    }
}
