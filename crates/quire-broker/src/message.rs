//! Broker message envelope.

/// One message on a topic.
///
/// `key` is the entity id; per-entity ordering holds because every topic is a
/// single totally ordered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    /// Backend-assigned position (stream entry id). Empty before publish.
    pub offset: String,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
            offset: String::new(),
        }
    }
}
