//! Redis Streams backend.
//!
//! Each topic is a stream. Publishing is `XADD <topic> * key <k> value <v>`;
//! consumers join with `XGROUP CREATE ... MKSTREAM` and read with
//! `XREADGROUP ... BLOCK <ms> COUNT <n> STREAMS <topics...> >`, acknowledging
//! with `XACK`. Every reader gets its own connection because `BLOCK` holds
//! the connection for the whole wait.
//!
//! A new reader first reads its own pending entries (id `0`): entries
//! delivered to the same consumer name before a reconnect or restart but
//! never acknowledged. Once that list comes back empty it switches to `>`.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{BrokerBackend, MessageSource, ReadOptions};
use crate::error::BrokerError;
use crate::message::BrokerMessage;

const KEY_FIELD: &str = "key";
const VALUE_FIELD: &str = "value";

/// Broker backed by Redis Streams.
///
/// Opening the broker only parses the URL; the publishing connection is
/// established on first use and re-established by the connection manager.
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
    read: ReadOptions,
    display_url: String,
}

impl RedisBroker {
    pub fn open(url: &str, read: ReadOptions) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Config(e.to_string()))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
            read,
            display_url: redact(url),
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager, BrokerError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!(
            subsystem = "broker",
            component = "redis",
            op = "connect",
            url = %self.display_url,
            "Connected to Redis broker"
        );
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

/// Mask credentials in a connection URL for logging.
fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((scheme_and_auth, host)) => {
            let scheme = scheme_and_auth.split("://").next().unwrap_or("redis");
            format!("{scheme}://***@{host}")
        }
        None => url.to_string(),
    }
}

#[async_trait]
impl BrokerBackend for RedisBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let fields: [(&str, &[u8]); 2] = [
            (KEY_FIELD, message.key.as_bytes()),
            (VALUE_FIELD, message.value.as_slice()),
        ];
        let id: String = conn
            .xadd(&message.topic, "*", &fields[..])
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        debug!(
            subsystem = "broker",
            component = "redis",
            op = "xadd",
            topic = %message.topic,
            offset = %id,
            "Message published"
        );
        Ok(())
    }

    async fn connect(
        &self,
        topics: &[String],
        group_id: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn MessageSource>, BrokerError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        for topic in topics {
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(topic, group_id, "$").await;
            match created {
                Ok(()) => debug!(
                    subsystem = "broker",
                    component = "redis",
                    topic = %topic,
                    group_id = %group_id,
                    "Consumer group created"
                ),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(BrokerError::from(e)),
            }
        }

        Ok(Box::new(RedisSource {
            conn,
            topics: topics.to_vec(),
            group_id: group_id.to_string(),
            consumer_name: consumer_name.to_string(),
            read: self.read.clone(),
            cursor: ReadCursor::Pending,
        }))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Which entries the next `XREADGROUP` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadCursor {
    /// This consumer's unacknowledged entries.
    Pending,
    /// Entries never delivered to the group.
    New,
}

impl ReadCursor {
    fn id(self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }

    fn after_read(self, entries: usize) -> Self {
        match self {
            ReadCursor::Pending if entries == 0 => ReadCursor::New,
            other => other,
        }
    }
}

struct RedisSource {
    conn: MultiplexedConnection,
    topics: Vec<String>,
    group_id: String,
    consumer_name: String,
    read: ReadOptions,
    cursor: ReadCursor,
}

#[async_trait]
impl MessageSource for RedisSource {
    async fn poll(&mut self) -> Result<Vec<BrokerMessage>, BrokerError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group_id, &self.consumer_name)
            .count(self.read.batch_size);
        if self.cursor == ReadCursor::New {
            options = options.block(self.read.block.as_millis() as usize);
        }
        let ids: Vec<&str> = self.topics.iter().map(|_| self.cursor.id()).collect();

        let reply: StreamReadReply = self
            .conn
            .xread_options(self.topics.as_slice(), ids.as_slice(), &options)
            .await?;

        let mut batch = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let key: String = entry.get(KEY_FIELD).unwrap_or_default();
                let value: Vec<u8> = entry.get(VALUE_FIELD).unwrap_or_default();
                batch.push(BrokerMessage {
                    topic: stream.key.clone(),
                    key,
                    value,
                    offset: entry.id,
                });
            }
        }

        let next = self.cursor.after_read(batch.len());
        if next != self.cursor {
            debug!(
                subsystem = "broker",
                component = "redis",
                group_id = %self.group_id,
                consumer = %self.consumer_name,
                "Pending entries replayed; reading new entries"
            );
        } else if self.cursor == ReadCursor::Pending {
            debug!(
                subsystem = "broker",
                component = "redis",
                group_id = %self.group_id,
                consumer = %self.consumer_name,
                replayed = batch.len(),
                "Replaying unacknowledged entries"
            );
        }
        self.cursor = next;
        Ok(batch)
    }

    async fn ack(&mut self, messages: &[BrokerMessage]) -> Result<(), BrokerError> {
        for topic in &self.topics {
            let ids: Vec<&str> = messages
                .iter()
                .filter(|m| &m.topic == topic)
                .map(|m| m.offset.as_str())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let _: i64 = self.conn.xack(topic, &self.group_id, ids.as_slice()).await?;
        }
        Ok(())
    }
}
