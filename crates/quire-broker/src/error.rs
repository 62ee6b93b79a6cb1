//! Broker transport errors.

use thiserror::Error;

/// Errors raised by broker backends, the producer and consumers.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A publish was rejected.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Joining a consumer group or reading from it failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The broker URL or settings are unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The consumer was closed.
    #[error("consumer closed")]
    Closed,
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
        {
            BrokerError::Connection(e.to_string())
        } else {
            BrokerError::Subscribe(e.to_string())
        }
    }
}

impl From<BrokerError> for quire_core::Error {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Config(msg) => quire_core::Error::Config(msg),
            other => quire_core::Error::Broker(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_into_core_error() {
        let err: quire_core::Error = BrokerError::Publish("NOGROUP".into()).into();
        assert!(matches!(err, quire_core::Error::Broker(_)));
        assert!(err.is_transient());

        let err: quire_core::Error = BrokerError::Config("bad url".into()).into();
        assert!(matches!(err, quire_core::Error::Config(_)));
    }
}
