//! In-process broker.
//!
//! Each topic is an append-only log; each consumer group keeps one cursor per
//! topic. A group joining a topic for the first time starts at the end of the
//! log, like `XGROUP CREATE ... $`. Entries handed to a consumer stay pending
//! under its name until acknowledged, and a new reader with the same name
//! gets them again before anything new. Availability can be toggled to
//! exercise reconnect paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::backend::{BrokerBackend, MessageSource, ReadOptions};
use crate::error::BrokerError;
use crate::message::BrokerMessage;

#[derive(Default)]
struct TopicLog {
    messages: Vec<BrokerMessage>,
    cursors: HashMap<String, usize>,
    /// Unacknowledged entry indexes per consumer name.
    pending: HashMap<String, BTreeSet<usize>>,
}

struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
    available: AtomicBool,
    connect_attempts: AtomicU32,
    read: ReadOptions,
}

/// Broker that keeps every topic in memory.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(ReadOptions {
            block: Duration::from_millis(quire_core::defaults::CONSUMER_BLOCK_MS),
            batch_size: quire_core::defaults::CONSUMER_BATCH_SIZE,
        })
    }
}

impl MemoryBroker {
    pub fn new(read: ReadOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
                connect_attempts: AtomicU32::new(0),
                read,
            }),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    ///
    /// While unavailable, publishes and connects fail and open readers
    /// return an error from their next poll.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Everything ever published to `topic`.
    pub async fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerBackend for MemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Publish("memory broker unavailable".into()));
        }
        {
            let mut topics = self.inner.topics.lock().await;
            let log = topics.entry(message.topic.clone()).or_default();
            let mut stored = message.clone();
            stored.offset = log.messages.len().to_string();
            log.messages.push(stored);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn connect(
        &self,
        topics: &[String],
        group_id: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn MessageSource>, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Err(BrokerError::Connection("memory broker unavailable".into()));
        }

        let mut logs = self.inner.topics.lock().await;
        for topic in topics {
            let log = logs.entry(topic.clone()).or_default();
            let end = log.messages.len();
            log.cursors.entry(group_id.to_string()).or_insert(end);
        }

        Ok(Box::new(MemorySource {
            inner: self.inner.clone(),
            topics: topics.to_vec(),
            group_id: group_id.to_string(),
            consumer_name: consumer_name.to_string(),
            replaying: true,
        }))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Connection("memory broker unavailable".into()))
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySource {
    inner: Arc<Inner>,
    topics: Vec<String>,
    group_id: String,
    consumer_name: String,
    replaying: bool,
}

impl MemorySource {
    /// Entries this consumer was given earlier and never acknowledged.
    async fn take_pending(&self) -> Vec<BrokerMessage> {
        let logs = self.inner.topics.lock().await;
        let mut batch = Vec::new();
        for topic in &self.topics {
            let Some(log) = logs.get(topic) else {
                continue;
            };
            let Some(pending) = log.pending.get(&self.consumer_name) else {
                continue;
            };
            let remaining = self.inner.read.batch_size.saturating_sub(batch.len());
            batch.extend(
                pending
                    .iter()
                    .take(remaining)
                    .map(|&index| log.messages[index].clone()),
            );
        }
        batch
    }

    async fn take_batch(&self) -> Vec<BrokerMessage> {
        let mut logs = self.inner.topics.lock().await;
        let mut batch = Vec::new();
        for topic in &self.topics {
            let remaining = self.inner.read.batch_size.saturating_sub(batch.len());
            if remaining == 0 {
                break;
            }
            let Some(log) = logs.get_mut(topic) else {
                continue;
            };
            let cursor = log.cursors.entry(self.group_id.clone()).or_insert(0);
            let start = *cursor;
            let end = (start + remaining).min(log.messages.len());
            *cursor = end;
            batch.extend_from_slice(&log.messages[start..end]);
            log.pending
                .entry(self.consumer_name.clone())
                .or_default()
                .extend(start..end);
        }
        batch
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll(&mut self) -> Result<Vec<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + self.inner.read.block;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.inner.available.load(Ordering::SeqCst) {
                return Err(BrokerError::Connection("memory broker unavailable".into()));
            }

            if self.replaying {
                let pending = self.take_pending().await;
                if !pending.is_empty() {
                    return Ok(pending);
                }
                self.replaying = false;
            }

            let batch = self.take_batch().await;
            if !batch.is_empty() {
                trace!(
                    subsystem = "broker",
                    component = "memory",
                    group_id = %self.group_id,
                    batch_size = batch.len(),
                    "Batch read"
                );
                return Ok(batch);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&mut self, messages: &[BrokerMessage]) -> Result<(), BrokerError> {
        let mut logs = self.inner.topics.lock().await;
        for message in messages {
            let Ok(index) = message.offset.parse::<usize>() else {
                continue;
            };
            if let Some(pending) = logs
                .get_mut(&message.topic)
                .and_then(|log| log.pending.get_mut(&self.consumer_name))
            {
                pending.remove(&index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_groups_read_independently() {
        let broker = MemoryBroker::default();
        let t = topics(&["note-events"]);
        let mut a = broker.connect(&t, "group-a", "a").await.unwrap();
        let mut b = broker.connect(&t, "group-b", "b").await.unwrap();

        broker
            .publish(&BrokerMessage::new("note-events", "k1", b"one".to_vec()))
            .await
            .unwrap();

        let from_a = a.poll().await.unwrap();
        let from_b = b.poll().await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_a[0].key, "k1");
        assert_eq!(from_a[0].offset, "0");
    }

    #[tokio::test]
    async fn test_new_group_starts_at_end() {
        let broker = MemoryBroker::default();
        broker
            .publish(&BrokerMessage::new("task-events", "old", vec![]))
            .await
            .unwrap();

        let mut source = broker
            .connect(&topics(&["task-events"]), "late", "c")
            .await
            .unwrap();
        broker
            .publish(&BrokerMessage::new("task-events", "new", vec![]))
            .await
            .unwrap();

        let batch = source.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_entries_are_replayed_to_same_member() {
        let broker = MemoryBroker::default();
        let t = topics(&["note-events"]);
        let mut first = broker.connect(&t, "fanout", "fanout-api-1").await.unwrap();
        for key in ["k1", "k2"] {
            broker
                .publish(&BrokerMessage::new("note-events", key, vec![]))
                .await
                .unwrap();
        }
        let read = first.poll().await.unwrap();
        assert_eq!(read.len(), 2);
        first.ack(&read[..1]).await.unwrap();
        drop(first);

        // Another member of the group does not see k2.
        let mut other = broker.connect(&t, "fanout", "fanout-api-2").await.unwrap();
        assert!(other.poll().await.unwrap().is_empty());

        let mut second = broker.connect(&t, "fanout", "fanout-api-1").await.unwrap();
        let replayed = second.poll().await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, "k2");
        assert_eq!(replayed[0].offset, read[1].offset);
        second.ack(&replayed).await.unwrap();

        broker
            .publish(&BrokerMessage::new("note-events", "k3", vec![]))
            .await
            .unwrap();
        let next = second.poll().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key, "k3");

        let mut third = broker.connect(&t, "fanout", "fanout-api-1").await.unwrap();
        second.ack(&next).await.unwrap();
        assert!(third.poll().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let broker = MemoryBroker::default();
        let mut source = broker
            .connect(&topics(&["block-events"]), "g", "c")
            .await
            .unwrap();
        assert!(source.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_connect_and_publish() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        assert!(broker
            .connect(&topics(&["note-events"]), "g", "c")
            .await
            .is_err());
        assert!(broker
            .publish(&BrokerMessage::new("note-events", "k", vec![]))
            .await
            .is_err());
        assert_eq!(broker.connect_attempts(), 1);
    }
}
