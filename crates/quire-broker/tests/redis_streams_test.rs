//! Redis Streams backend tests.
//!
//! Require a Redis server at `REDIS_URL` (default `redis://127.0.0.1:6379`);
//! run with `cargo test -p quire-broker -- --ignored`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quire_broker::{BrokerBackend, BrokerMessage, ReadOptions, RedisBroker};

fn broker() -> RedisBroker {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisBroker::open(
        &url,
        ReadOptions {
            block: Duration::from_millis(100),
            batch_size: 16,
        },
    )
    .unwrap()
}

fn unique_topic(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}-{nanos}")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_publish_and_group_read() {
    let broker = broker();
    broker.ping().await.unwrap();
    let topics = vec![unique_topic("note-events")];

    let mut source = broker.connect(&topics, "fanout", "fanout-a").await.unwrap();
    broker
        .publish(&BrokerMessage::new(&topics[0], "k1", b"one".to_vec()))
        .await
        .unwrap();

    let mut batch = Vec::new();
    for _ in 0..5 {
        batch = source.poll().await.unwrap();
        if !batch.is_empty() {
            break;
        }
    }
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key, "k1");
    assert_eq!(batch[0].value, b"one".to_vec());
    source.ack(&batch).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_unacked_entries_replayed_after_reconnect() {
    let broker = broker();
    let topics = vec![unique_topic("task-events")];

    let mut first = broker.connect(&topics, "sync", "sync-a").await.unwrap();
    broker
        .publish(&BrokerMessage::new(&topics[0], "k1", b"one".to_vec()))
        .await
        .unwrap();
    let mut read = Vec::new();
    for _ in 0..5 {
        read = first.poll().await.unwrap();
        if !read.is_empty() {
            break;
        }
    }
    assert_eq!(read.len(), 1);
    drop(first);

    let mut second = broker.connect(&topics, "sync", "sync-a").await.unwrap();
    let replayed = second.poll().await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].offset, read[0].offset);
    second.ack(&replayed).await.unwrap();

    let mut third = broker.connect(&topics, "sync", "sync-a").await.unwrap();
    assert!(third.poll().await.unwrap().is_empty());
}
