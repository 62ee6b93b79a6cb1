//! Broker and consumer configuration.

use std::sync::Arc;
use std::time::Duration;

use quire_core::defaults;

use crate::backend::{BrokerBackend, ReadOptions};
use crate::error::BrokerError;
use crate::memory::MemoryBroker;
use crate::producer::PublishMode;
use crate::streams::RedisBroker;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Capacity of the channel between the read loop and its readers.
    pub channel_capacity: usize,
    /// How long a full channel is waited on before the message is dropped.
    pub send_timeout: Duration,
    /// Reconnect attempts after a connection failure before going idle.
    pub max_retries: u32,
    /// Fixed delay between reconnect attempts.
    pub retry_interval: Duration,
    /// Longest a single broker read blocks.
    pub block: Duration,
    pub batch_size: usize,
    /// Stable member name within the consumer group. Entries read but not
    /// acknowledged stay pending under this name and are read again after a
    /// reconnect or restart.
    pub member_id: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::CONSUMER_CHANNEL_CAPACITY,
            send_timeout: Duration::from_millis(defaults::CONSUMER_SEND_TIMEOUT_MS),
            max_retries: defaults::CONSUMER_MAX_RETRIES,
            retry_interval: Duration::from_millis(defaults::CONSUMER_RETRY_INTERVAL_MS),
            block: Duration::from_millis(defaults::CONSUMER_BLOCK_MS),
            batch_size: defaults::CONSUMER_BATCH_SIZE,
            member_id: defaults::CONSUMER_MEMBER_ID.to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CONSUMER_CHANNEL_CAPACITY` | `256` |
    /// | `CONSUMER_SEND_TIMEOUT_MS` | `100` |
    /// | `CONSUMER_MAX_RETRIES` | `5` |
    /// | `CONSUMER_RETRY_INTERVAL_MS` | `5000` |
    /// | `CONSUMER_BLOCK_MS` | `1000` |
    /// | `CONSUMER_BATCH_SIZE` | `64` |
    /// | `CONSUMER_MEMBER_ID` | `$HOSTNAME`, else `quire` |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            channel_capacity: env_parse("CONSUMER_CHANNEL_CAPACITY")
                .unwrap_or(base.channel_capacity)
                .max(1),
            send_timeout: env_parse("CONSUMER_SEND_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.send_timeout),
            max_retries: env_parse("CONSUMER_MAX_RETRIES").unwrap_or(base.max_retries),
            retry_interval: env_parse("CONSUMER_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.retry_interval),
            block: env_parse("CONSUMER_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.block),
            batch_size: env_parse("CONSUMER_BATCH_SIZE")
                .unwrap_or(base.batch_size)
                .max(1),
            member_id: std::env::var("CONSUMER_MEMBER_ID")
                .or_else(|_| std::env::var("HOSTNAME"))
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(base.member_id),
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = member_id.into();
        self
    }

    /// Name this process joins `group_id` under.
    pub fn consumer_name(&self, group_id: &str) -> String {
        format!("{}-{}", group_id, self.member_id)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            block: self.block,
            batch_size: self.batch_size,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub enabled: bool,
    /// `redis://…`, `rediss://…` or `memory://`.
    pub url: String,
    pub publish_mode: PublishMode,
    pub consumer: ConsumerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: defaults::BROKER_URL.to_string(),
            publish_mode: PublishMode::Sync,
            consumer: ConsumerConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Reads `BROKER_ENABLED`, `BROKER_URL`, `BROKER_PUBLISH_MODE` and the
    /// consumer variables.
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("BROKER_ENABLED", true),
            url: std::env::var("BROKER_URL").unwrap_or_else(|_| defaults::BROKER_URL.to_string()),
            publish_mode: env_parse("BROKER_PUBLISH_MODE").unwrap_or_default(),
            consumer: ConsumerConfig::from_env(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Build the backend named by `url`. Does not contact the broker; only
    /// an unusable URL is an error here.
    pub fn backend(&self) -> Result<Arc<dyn BrokerBackend>, BrokerError> {
        if self.url.starts_with("memory://") {
            return Ok(Arc::new(MemoryBroker::new(self.consumer.read_options())));
        }
        if self.url.starts_with("redis://") || self.url.starts_with("rediss://") {
            let broker = RedisBroker::open(&self.url, self.consumer.read_options())?;
            return Ok(Arc::new(broker));
        }
        Err(BrokerError::Config(format!(
            "unsupported broker url scheme: {}",
            self.url.split("://").next().unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_millis(100));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.member_id, "quire");
    }

    #[test]
    fn test_consumer_name_is_stable_per_group() {
        let config = ConsumerConfig::default().with_member_id("api-1");
        assert_eq!(config.consumer_name("realtime-fanout"), "realtime-fanout-api-1");
        assert_eq!(
            config.consumer_name("realtime-fanout"),
            config.clone().consumer_name("realtime-fanout")
        );
    }

    #[test]
    fn test_capacity_never_zero() {
        assert_eq!(ConsumerConfig::default().with_channel_capacity(0).channel_capacity, 1);
    }

    #[tokio::test]
    async fn test_memory_url_builds_memory_backend() {
        let config = BrokerConfig::default().with_url("memory://");
        let backend = config.backend().unwrap();
        assert_eq!(backend.name(), "memory");
        assert!(backend.ping().await.is_ok());
    }

    #[test]
    fn test_redis_url_opens_without_connecting() {
        let config = BrokerConfig::default().with_url("redis://127.0.0.1:1");
        assert_eq!(config.backend().unwrap().name(), "redis");
    }

    #[test]
    fn test_unknown_scheme_is_config_error() {
        let config = BrokerConfig::default().with_url("kafka://localhost:9092");
        assert!(matches!(config.backend(), Err(BrokerError::Config(_))));
    }
}
