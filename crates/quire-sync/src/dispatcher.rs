//! Outbox dispatcher: moves committed events from the outbox to the broker.
//!
//! Each tick fetches undispatched events oldest first and publishes them one
//! at a time to `topic(entity)` keyed by `entity_id`. The first publish
//! failure is recorded on its row and ends the tick, so the next tick retries
//! from the same event and per-entity order is preserved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use quire_broker::Producer;
use quire_core::{defaults, Error, OutboxRepository, Result};

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// Fixed delay between ticks.
    pub poll_interval: Duration,
    /// Maximum events fetched per tick.
    pub batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(defaults::OUTBOX_POLL_INTERVAL_MS),
            batch_size: defaults::OUTBOX_BATCH_SIZE,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OUTBOX_DISPATCHER_ENABLED` | `true` |
    /// | `OUTBOX_POLL_INTERVAL_MS` | `1000` |
    /// | `OUTBOX_BATCH_SIZE` | `100` |
    pub fn from_env() -> Self {
        let enabled = std::env::var("OUTBOX_DISPATCHER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("OUTBOX_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::OUTBOX_POLL_INTERVAL_MS);

        let batch_size = std::env::var("OUTBOX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::OUTBOX_BATCH_SIZE)
            .max(1);

        Self {
            enabled,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Running totals since start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub published: u64,
    pub failures: u64,
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub published: usize,
    /// The event whose publish failed and ended the tick.
    pub failed: Option<Uuid>,
}

/// Handle for controlling a running dispatcher.
pub struct DispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    stats: watch::Receiver<DispatcherStats>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Signal shutdown and wait for the current tick to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("dispatcher task failed: {e}")))?;
        Ok(())
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<DispatcherStats> {
        self.stats.clone()
    }
}

/// Polls the outbox and publishes pending events.
pub struct EventDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    producer: Producer,
    config: DispatcherConfig,
    stats: watch::Sender<DispatcherStats>,
}

impl EventDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        producer: Producer,
        config: DispatcherConfig,
    ) -> Self {
        let (stats, _) = watch::channel(DispatcherStats::default());
        Self {
            outbox,
            producer,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.borrow().clone()
    }

    /// Run one tick.
    ///
    /// Returns an error only when the outbox itself fails; publish failures
    /// are recorded on the event and reported in [`TickReport::failed`].
    pub async fn run_once(&self) -> Result<TickReport> {
        let start = Instant::now();
        let events = self.outbox.fetch_pending(self.config.batch_size).await?;
        let mut report = TickReport {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            let published = match event.to_wire() {
                Ok(value) => self
                    .producer
                    .publish(event.topic(), &event.key(), value)
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e),
            };

            match published {
                Ok(()) => {
                    self.outbox.mark_dispatched(event.id, Utc::now()).await?;
                    report.published += 1;
                    debug!(
                        subsystem = "outbox",
                        component = "dispatcher",
                        event_id = %event.id,
                        event = %event.name,
                        topic = event.topic(),
                        "Event dispatched"
                    );
                }
                Err(e) => {
                    warn!(
                        subsystem = "outbox",
                        component = "dispatcher",
                        event_id = %event.id,
                        event = %event.name,
                        topic = event.topic(),
                        attempt = event.attempts + 1,
                        error = %e,
                        "Publish failed; retrying next tick"
                    );
                    report.failed = Some(event.id);
                    self.outbox.mark_failed(event.id, &e.to_string()).await?;
                    break;
                }
            }
        }

        self.stats.send_modify(|stats| {
            stats.ticks += 1;
            stats.published += report.published as u64;
            stats.failures += u64::from(report.failed.is_some());
        });

        if report.fetched > 0 {
            info!(
                subsystem = "outbox",
                component = "dispatcher",
                batch_size = report.fetched,
                published = report.published,
                failed = report.failed.is_some(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Outbox tick complete"
            );
        }
        Ok(report)
    }

    /// Start the dispatcher loop and return a handle for control.
    pub fn start(self) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let stats = self.stats.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        DispatcherHandle {
            shutdown_tx,
            stats,
            join,
        }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Outbox dispatcher is disabled, not starting");
            return;
        }

        info!(
            subsystem = "outbox",
            component = "dispatcher",
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            publish_mode = %self.producer.mode(),
            "Outbox dispatcher started"
        );

        loop {
            match self.run_once().await {
                Err(e) if e.is_transient() => warn!(
                    subsystem = "outbox",
                    component = "dispatcher",
                    error = %e,
                    "Outbox tick aborted; retrying next tick"
                ),
                Err(e) => error!(
                    subsystem = "outbox",
                    component = "dispatcher",
                    error = %e,
                    "Outbox tick aborted"
                ),
                Ok(_) => {}
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Outbox dispatcher received shutdown signal");
                    break;
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            subsystem = "outbox",
            component = "dispatcher",
            "Outbox dispatcher stopped"
        );
    }
}
