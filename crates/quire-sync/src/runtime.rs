//! Process-level wiring of the dispatcher, consumers and services.
//!
//! Fanout and sync read through separate consumer groups so each keeps its
//! own broker offsets. If the broker cannot be reached at startup the
//! dispatcher is not started; the consumers still start and sit in their
//! reconnect loops, and [`SyncRuntime::status`] reports `degraded`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use quire_broker::{
    BrokerBackend, BrokerConfig, Consumer, ConsumerRegistry, ConsumerState, Producer,
};
use quire_core::{
    defaults, AccessControl, BlockRepository, OutboxRepository, TaskRepository, ALL_TOPICS,
    SYNC_SERVICE_TOPICS,
};

use crate::dispatcher::{DispatcherConfig, DispatcherHandle, DispatcherStats, EventDispatcher};
use crate::fanout::{FanoutConfig, FanoutService};
use crate::task_sync::{CrossEntitySyncService, SyncConfig, SyncStats};

/// Collaborators handed to the runtime.
#[derive(Clone)]
pub struct SyncDeps {
    pub outbox: Arc<dyn OutboxRepository>,
    pub blocks: Arc<dyn BlockRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub access: Arc<dyn AccessControl>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
    pub fanout: FanoutConfig,
    pub sync: SyncConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            broker: BrokerConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            fanout: FanoutConfig::from_env(),
            sync: SyncConfig::from_env(),
        }
    }
}

/// Health snapshot for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    /// `ok`, `degraded` or `disabled`.
    pub status: &'static str,
    pub broker: &'static str,
    pub dispatcher: &'static str,
    pub fanout_consumer: &'static str,
    pub sync_consumer: &'static str,
    pub connections: usize,
    pub published: u64,
    pub publish_failures: u64,
    pub sync_applied: u64,
    pub dropped: u64,
}

/// Owns every background worker.
///
/// Shared as `Arc<SyncRuntime>`; [`SyncRuntime::shutdown`] takes `&self` so
/// it works while request handlers still hold references.
pub struct SyncRuntime {
    fanout: Arc<FanoutService>,
    sync: Arc<CrossEntitySyncService>,
    registry: Option<ConsumerRegistry>,
    fanout_consumer: Option<Consumer>,
    sync_consumer: Option<Consumer>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    dispatcher_stats: Option<watch::Receiver<DispatcherStats>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    broker_enabled: bool,
    dispatcher_enabled: bool,
}

impl SyncRuntime {
    /// Start every worker. Never fails; an unreachable broker degrades.
    pub async fn start(
        backend: Arc<dyn BrokerBackend>,
        deps: SyncDeps,
        config: RuntimeConfig,
    ) -> Self {
        let fanout = Arc::new(FanoutService::new(deps.access.clone(), config.fanout.clone()));
        let sync = Arc::new(CrossEntitySyncService::new(
            deps.blocks.clone(),
            deps.tasks.clone(),
            config.sync.clone(),
        ));

        if !config.broker.enabled {
            warn!(
                subsystem = "runtime",
                "Broker disabled; events stay in the outbox and realtime delivery is off"
            );
            return Self {
                fanout,
                sync,
                registry: None,
                fanout_consumer: None,
                sync_consumer: None,
                dispatcher: Mutex::new(None),
                dispatcher_stats: None,
                workers: Mutex::new(Vec::new()),
                broker_enabled: false,
                dispatcher_enabled: config.dispatcher.enabled,
            };
        }

        let reachable = match backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    subsystem = "runtime",
                    backend = backend.name(),
                    error = %e,
                    "Broker unreachable at startup; outbox dispatcher not started"
                );
                false
            }
        };

        let dispatcher = if reachable && config.dispatcher.enabled {
            let producer = Producer::new(backend.clone(), config.broker.publish_mode);
            let dispatcher =
                EventDispatcher::new(deps.outbox.clone(), producer, config.dispatcher.clone());
            Some(dispatcher.start())
        } else {
            None
        };

        let registry = ConsumerRegistry::new(backend.clone(), config.broker.consumer.clone());
        let mut workers = Vec::new();

        let fanout_consumer = registry
            .get_or_start(defaults::FANOUT_GROUP_ID, &ALL_TOPICS)
            .await;
        workers.push(tokio::spawn(fanout.clone().run(fanout_consumer.stream())));

        let sync_consumer = if config.sync.enabled {
            let consumer = registry
                .get_or_start(defaults::SYNC_GROUP_ID, &SYNC_SERVICE_TOPICS)
                .await;
            workers.push(tokio::spawn(sync.clone().run(consumer.stream())));
            Some(consumer)
        } else {
            None
        };

        info!(
            subsystem = "runtime",
            backend = backend.name(),
            broker_reachable = reachable,
            dispatcher = dispatcher.is_some(),
            sync = sync_consumer.is_some(),
            "Sync runtime started"
        );

        Self {
            fanout,
            sync,
            registry: Some(registry),
            fanout_consumer: Some(fanout_consumer),
            sync_consumer,
            dispatcher_stats: dispatcher.as_ref().map(|d| d.watch_stats()),
            dispatcher: Mutex::new(dispatcher),
            workers: Mutex::new(workers),
            broker_enabled: true,
            dispatcher_enabled: config.dispatcher.enabled,
        }
    }

    pub fn fanout(&self) -> Arc<FanoutService> {
        self.fanout.clone()
    }

    pub fn sync(&self) -> Arc<CrossEntitySyncService> {
        self.sync.clone()
    }

    /// Last published dispatcher counters; still readable after shutdown.
    pub fn dispatcher_stats(&self) -> Option<DispatcherStats> {
        self.dispatcher_stats.as_ref().map(|s| s.borrow().clone())
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub async fn status(&self) -> RuntimeStatus {
        let state_of = |c: &Option<Consumer>| c.as_ref().map(|c| c.state());
        let fanout_state = state_of(&self.fanout_consumer);
        let sync_state = state_of(&self.sync_consumer);
        let dispatcher_stats = self.dispatcher_stats().unwrap_or_default();
        let dropped: u64 = [&self.fanout_consumer, &self.sync_consumer]
            .into_iter()
            .flatten()
            .map(|c| c.dropped())
            .sum();

        let dispatcher_running = self.dispatcher.lock().await.is_some();
        let dispatcher_ok = dispatcher_running || !self.dispatcher_enabled;
        let consuming =
            |s: Option<ConsumerState>| matches!(s, None | Some(ConsumerState::Consuming));
        let status = if !self.broker_enabled {
            "disabled"
        } else if dispatcher_ok && consuming(fanout_state) && consuming(sync_state) {
            "ok"
        } else {
            "degraded"
        };

        RuntimeStatus {
            status,
            broker: match (self.broker_enabled, fanout_state) {
                (false, _) => "disabled",
                (true, Some(ConsumerState::Consuming)) => "connected",
                _ => "unreachable",
            },
            dispatcher: match (dispatcher_running, self.dispatcher_enabled) {
                (true, _) => "running",
                (false, true) => "stopped",
                (false, false) => "disabled",
            },
            fanout_consumer: fanout_state.map(|s| s.as_str()).unwrap_or("none"),
            sync_consumer: sync_state.map(|s| s.as_str()).unwrap_or("none"),
            connections: self.fanout.connection_count().await,
            published: dispatcher_stats.published,
            publish_failures: dispatcher_stats.failures,
            sync_applied: self.sync.stats().applied,
            dropped,
        }
    }

    /// Stop the dispatcher, close every consumer and wait for the loops.
    ///
    /// A second call finds nothing left to stop.
    pub async fn shutdown(&self) {
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.shutdown().await {
                warn!(subsystem = "runtime", error = %e, "Dispatcher shutdown failed");
            }
        }
        if let Some(registry) = &self.registry {
            registry.close_all().await;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(subsystem = "runtime", error = %e, "Worker task failed");
            }
        }
        info!(subsystem = "runtime", "Sync runtime stopped");
    }
}
