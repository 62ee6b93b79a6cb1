//! Broker consumer with a bounded hand-off channel and bounded reconnects.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──ok──▶ Consuming ──error──▶ Reconnecting{1..=max_retries}
//!     │                  ▲                        │        │
//!     └──error───────────┼────────────────────────┘        │ exhausted
//!                        └──────────ok────────────────────┘ ▼
//!                                                         Idle
//! any state ──close()──▶ Closed
//! ```
//!
//! Messages read from the broker are pushed into a bounded channel. A full
//! channel is waited on for at most `send_timeout`; after that the message is
//! dropped, a warning is logged and the `dropped` counter increases. The read
//! loop is never blocked longer than that by a slow reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{error, info, trace, warn};

use crate::backend::{BrokerBackend, MessageSource};
use crate::config::ConsumerConfig;
use crate::error::BrokerError;
use crate::message::BrokerMessage;

/// Observable consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Consuming,
    Reconnecting { attempt: u32 },
    /// Reconnects exhausted; the consumer stays inert until closed.
    Idle,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Reconnecting { .. } => "reconnecting",
            ConsumerState::Idle => "idle",
            ConsumerState::Closed => "closed",
        }
    }
}

/// Cloneable reader over a consumer's channel.
///
/// `recv` returns `None` once the consumer is closed and the channel drained.
#[derive(Clone)]
pub struct MessageStream {
    rx: Arc<Mutex<mpsc::Receiver<BrokerMessage>>>,
    closed: watch::Receiver<bool>,
}

impl MessageStream {
    pub async fn recv(&self) -> Option<BrokerMessage> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed.clone();
        loop {
            if let Ok(message) = rx.try_recv() {
                return Some(message);
            }
            if *closed.borrow_and_update() {
                return None;
            }
            tokio::select! {
                message = rx.recv() => return message,
                changed = closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

struct Shared {
    group_id: String,
    topics: Vec<String>,
    state: watch::Sender<ConsumerState>,
    closed: watch::Sender<bool>,
    sender: mpsc::Sender<BrokerMessage>,
    stream: MessageStream,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// A consumer-group member reading a fixed topic set.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Spawn the read loop. Never fails: connection problems are handled by
    /// the reconnect policy and visible through [`Consumer::state`].
    pub fn start(
        backend: Arc<dyn BrokerBackend>,
        group_id: &str,
        topics: &[&str],
        config: ConsumerConfig,
    ) -> Self {
        let (sender, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let (state, _) = watch::channel(ConsumerState::Connecting);

        let shared = Arc::new(Shared {
            group_id: group_id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            state,
            closed,
            sender,
            stream: MessageStream {
                rx: Arc::new(Mutex::new(rx)),
                closed: closed_rx,
            },
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let reader = ReadLoop {
            shared: shared.clone(),
            backend,
            consumer_name: config.consumer_name(group_id),
            config,
        };
        tokio::spawn(reader.run());

        Self { shared }
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.shared.topics
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.state.subscribe()
    }

    pub fn stream(&self) -> MessageStream {
        self.shared.stream.clone()
    }

    /// Messages handed to the channel.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because the channel stayed full past `send_timeout`.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the read loop. Idempotent; the channel stays open so readers can
    /// drain what was already delivered.
    pub fn close(&self) {
        let was_closed = self.shared.closed.send_replace(true);
        if !was_closed {
            info!(
                subsystem = "broker",
                component = "consumer",
                group_id = %self.shared.group_id,
                "Consumer closing"
            );
        }
    }
}

enum Interrupted {
    Closed,
    Failed(BrokerError),
}

struct ReadLoop {
    shared: Arc<Shared>,
    backend: Arc<dyn BrokerBackend>,
    config: ConsumerConfig,
    consumer_name: String,
}

impl ReadLoop {
    async fn run(self) {
        let mut closed = self.shared.closed.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if self.shared.is_closed() {
                break;
            }
            self.shared.set_state(if attempt == 0 {
                ConsumerState::Connecting
            } else {
                ConsumerState::Reconnecting { attempt }
            });

            let failure = match self
                .backend
                .connect(&self.shared.topics, &self.shared.group_id, &self.consumer_name)
                .await
            {
                Ok(source) => {
                    attempt = 0;
                    self.shared.set_state(ConsumerState::Consuming);
                    info!(
                        subsystem = "broker",
                        component = "consumer",
                        group_id = %self.shared.group_id,
                        topics = %self.shared.topics.join(","),
                        backend = self.backend.name(),
                        "Consumer subscribed"
                    );
                    match self.consume(source, &mut closed).await {
                        Interrupted::Closed => break,
                        Interrupted::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                error!(
                    subsystem = "broker",
                    component = "consumer",
                    group_id = %self.shared.group_id,
                    max_retries = self.config.max_retries,
                    error = %failure,
                    "Broker unreachable; consumer idle until closed"
                );
                self.shared.set_state(ConsumerState::Idle);
                wait_closed(&mut closed).await;
                break;
            }

            attempt += 1;
            warn!(
                subsystem = "broker",
                component = "consumer",
                group_id = %self.shared.group_id,
                attempt,
                max_retries = self.config.max_retries,
                retry_in_ms = self.config.retry_interval.as_millis() as u64,
                error = %failure,
                "Broker connection failed; will reconnect"
            );
            self.shared
                .set_state(ConsumerState::Reconnecting { attempt });

            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                _ = sleep(self.config.retry_interval) => {}
            }
        }

        self.shared.set_state(ConsumerState::Closed);
        info!(
            subsystem = "broker",
            component = "consumer",
            group_id = %self.shared.group_id,
            delivered = self.shared.delivered.load(Ordering::Relaxed),
            dropped = self.shared.dropped.load(Ordering::Relaxed),
            "Consumer stopped"
        );
    }

    async fn consume(
        &self,
        mut source: Box<dyn MessageSource>,
        closed: &mut watch::Receiver<bool>,
    ) -> Interrupted {
        loop {
            if self.shared.is_closed() {
                return Interrupted::Closed;
            }
            let batch = tokio::select! {
                _ = wait_closed(closed) => return Interrupted::Closed,
                polled = source.poll() => match polled {
                    Ok(batch) => batch,
                    Err(e) => return Interrupted::Failed(e),
                },
            };
            if batch.is_empty() {
                continue;
            }

            for message in &batch {
                self.forward(message.clone()).await;
            }
            if let Err(e) = source.ack(&batch).await {
                return Interrupted::Failed(e);
            }
        }
    }

    async fn forward(&self, message: BrokerMessage) {
        match self
            .shared
            .sender
            .send_timeout(message, self.config.send_timeout)
            .await
        {
            Ok(()) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(
                    subsystem = "broker",
                    component = "consumer",
                    group_id = %self.shared.group_id,
                    "Message forwarded"
                );
            }
            Err(SendTimeoutError::Timeout(message)) | Err(SendTimeoutError::Closed(message)) => {
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subsystem = "broker",
                    component = "consumer",
                    group_id = %self.shared.group_id,
                    topic = %message.topic,
                    key = %message.key,
                    dropped_total = dropped,
                    "Consumer channel full; message dropped"
                );
            }
        }
    }
}

/// Resolves once the closed flag is set (or its sender is gone).
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
