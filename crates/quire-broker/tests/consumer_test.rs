//! Consumer behaviour against the in-memory broker: backpressure, reconnect
//! policy, close semantics and registry de-duplication.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use quire_broker::{
    BrokerBackend, BrokerMessage, Consumer, ConsumerConfig, ConsumerRegistry, ConsumerState,
    MemoryBroker,
};

const TOPIC: &str = "note-events";

fn config() -> ConsumerConfig {
    ConsumerConfig::default()
        .with_channel_capacity(2)
        .with_send_timeout(Duration::from_millis(100))
        .with_max_retries(3)
        .with_retry_interval(Duration::from_secs(5))
        .with_block(Duration::from_millis(200))
}

async fn wait_for_state(consumer: &Consumer, wanted: ConsumerState) {
    let mut states = consumer.watch_state();
    timeout(Duration::from_secs(120), states.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

async fn publish(broker: &MemoryBroker, key: &str) {
    broker
        .publish(&BrokerMessage::new(TOPIC, key, key.as_bytes().to_vec()))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_channel_drops_exactly_one_and_keeps_reading() {
    let broker = MemoryBroker::default();
    let consumer = Consumer::start(Arc::new(broker.clone()), "fanout", &[TOPIC], config());
    wait_for_state(&consumer, ConsumerState::Consuming).await;

    // Capacity 2, nobody reading: the third message must be dropped.
    for key in ["m1", "m2", "m3"] {
        publish(&broker, key).await;
    }
    for _ in 0..100 {
        if consumer.dropped() == 1 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(consumer.dropped(), 1);
    assert_eq!(consumer.delivered(), 2);
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    let stream = consumer.stream();
    assert_eq!(stream.recv().await.unwrap().key, "m1");
    assert_eq!(stream.recv().await.unwrap().key, "m2");

    // The loop is still alive after the drop.
    publish(&broker, "m4").await;
    let next = timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.key, "m4");
    assert_eq!(consumer.dropped(), 1);

    consumer.close();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_exactly_max_retries_then_idles() {
    let broker = MemoryBroker::default();
    broker.set_available(false);

    let started = Instant::now();
    let consumer = Consumer::start(Arc::new(broker.clone()), "sync", &[TOPIC], config());
    wait_for_state(&consumer, ConsumerState::Idle).await;

    // One initial attempt plus three retries, five seconds apart.
    assert_eq!(broker.connect_attempts(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "elapsed {elapsed:?}");

    // Idle is terminal until close, even if the broker comes back.
    broker.set_available(true);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(consumer.state(), ConsumerState::Idle);

    consumer.close();
    wait_for_state(&consumer, ConsumerState::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_resubscribes_and_resets_attempts() {
    let broker = MemoryBroker::default();
    let consumer = Consumer::start(Arc::new(broker.clone()), "fanout", &[TOPIC], config());
    wait_for_state(&consumer, ConsumerState::Consuming).await;

    broker.set_available(false);
    wait_for_state(&consumer, ConsumerState::Reconnecting { attempt: 1 }).await;
    broker.set_available(true);
    wait_for_state(&consumer, ConsumerState::Consuming).await;
    assert_eq!(broker.connect_attempts(), 2);

    publish(&broker, "after-reconnect").await;
    let message = timeout(Duration::from_secs(5), consumer.stream().recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.key, "after-reconnect");

    // A second outage gets the full retry budget again.
    broker.set_available(false);
    wait_for_state(&consumer, ConsumerState::Reconnecting { attempt: 3 }).await;
    broker.set_available(true);
    wait_for_state(&consumer, ConsumerState::Consuming).await;

    consumer.close();
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_ends_stream() {
    let broker = MemoryBroker::default();
    let consumer = Consumer::start(Arc::new(broker.clone()), "fanout", &[TOPIC], config());
    wait_for_state(&consumer, ConsumerState::Consuming).await;

    publish(&broker, "before-close").await;
    let stream = consumer.stream();
    for _ in 0..100 {
        if consumer.delivered() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    consumer.close();
    consumer.close();
    wait_for_state(&consumer, ConsumerState::Closed).await;
    assert!(consumer.is_closed());

    // Already-delivered messages drain, then the stream ends.
    assert_eq!(stream.recv().await.unwrap().key, "before-close");
    assert!(stream.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_registry_deduplicates_by_group_and_topic_set() {
    let broker = MemoryBroker::default();
    let registry = ConsumerRegistry::new(Arc::new(broker.clone()), config());

    let a = registry
        .get_or_start("cross-entity-sync", &["task-events", "block-events"])
        .await;
    let b = registry
        .get_or_start("cross-entity-sync", &["block-events", "task-events"])
        .await;
    assert_eq!(registry.len().await, 1);
    assert_eq!(a.topics(), b.topics());

    let c = registry
        .get_or_start("realtime-fanout", &["block-events", "task-events"])
        .await;
    assert_eq!(registry.len().await, 2);

    registry.close_all().await;
    assert!(registry.is_empty().await);
    assert!(a.is_closed() && b.is_closed() && c.is_closed());

    let fresh = registry
        .get_or_start("cross-entity-sync", &["task-events", "block-events"])
        .await;
    assert!(!fresh.is_closed());
    fresh.close();
}
