//! Realtime fanout: delivers broker events to subscribed WebSocket
//! connections after an access check.
//!
//! The service owns the connection registry. Each connection has a bounded
//! outbound channel drained by its writer task; a slow client loses messages
//! for itself only and a closed client is removed on the next delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use quire_broker::{BrokerMessage, MessageStream};
use quire_core::{
    defaults, AccessControl, ClientMessage, Error, Event, EventMessage, Result, Role,
    StandardMessage, Subscription,
};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Outbound channel capacity per connection.
    pub outbound_capacity: usize,
    /// Maximum wait for room in a connection's outbound channel.
    pub send_timeout: Duration,
    pub max_subscriptions: usize,
    /// Role required to receive events for a resource.
    pub minimum_role: Role,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: defaults::FANOUT_OUTBOUND_CAPACITY,
            send_timeout: Duration::from_millis(defaults::FANOUT_SEND_TIMEOUT_MS),
            max_subscriptions: defaults::FANOUT_MAX_SUBSCRIPTIONS,
            minimum_role: Role::Viewer,
        }
    }
}

impl FanoutConfig {
    /// Reads `FANOUT_OUTBOUND_CAPACITY`, `FANOUT_SEND_TIMEOUT_MS` and
    /// `FANOUT_MAX_SUBSCRIPTIONS`.
    pub fn from_env() -> Self {
        let outbound_capacity = std::env::var("FANOUT_OUTBOUND_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::FANOUT_OUTBOUND_CAPACITY)
            .max(1);
        let send_timeout_ms = std::env::var("FANOUT_SEND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::FANOUT_SEND_TIMEOUT_MS);
        let max_subscriptions = std::env::var("FANOUT_MAX_SUBSCRIPTIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::FANOUT_MAX_SUBSCRIPTIONS);

        Self {
            outbound_capacity,
            send_timeout: Duration::from_millis(send_timeout_ms),
            max_subscriptions,
            minimum_role: Role::Viewer,
        }
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = max;
        self
    }

    pub fn with_minimum_role(mut self, role: Role) -> Self {
        self.minimum_role = role;
        self
    }
}

/// Per-delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Connections with a matching subscription.
    pub matched: usize,
    /// Matched but refused by access control (or the check failed).
    pub denied: usize,
    pub delivered: usize,
    /// Outbound channel stayed full past the send timeout.
    pub dropped: usize,
    /// Outbound channel closed; the connection was removed.
    pub failed: usize,
}

struct Connection {
    user_id: Uuid,
    subscriptions: HashSet<Subscription>,
    tx: mpsc::Sender<StandardMessage>,
}

pub struct FanoutService {
    access: Arc<dyn AccessControl>,
    config: FanoutConfig,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl FanoutService {
    pub fn new(access: Arc<dyn AccessControl>, config: FanoutConfig) -> Self {
        Self {
            access,
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection for an authenticated user.
    ///
    /// The returned receiver is the connection's outbound queue; the caller's
    /// writer task drains it onto the socket.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<StandardMessage>) {
        let id = quire_core::new_v7();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            Connection {
                user_id,
                subscriptions: HashSet::new(),
                tx,
            },
        );
        info!(
            subsystem = "realtime",
            component = "fanout",
            connection_id = %id,
            user_id = %user_id,
            active = connections.len(),
            "Connection registered"
        );
        (id, rx)
    }

    /// Remove a connection. Unknown ids are ignored.
    pub async fn close(&self, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            info!(
                subsystem = "realtime",
                component = "fanout",
                connection_id = %id,
                active = connections.len(),
                "Connection closed"
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn subscriptions(&self, id: ConnectionId) -> Vec<Subscription> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a subscription. Re-subscribing to an existing one is a no-op.
    pub async fn subscribe(&self, id: ConnectionId, subscription: Subscription) -> Result<()> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;

        if conn.subscriptions.contains(&subscription) {
            return Ok(());
        }
        if conn.subscriptions.len() >= self.config.max_subscriptions {
            return Err(Error::InvalidInput(format!(
                "subscription limit of {} reached",
                self.config.max_subscriptions
            )));
        }
        debug!(
            subsystem = "realtime",
            component = "fanout",
            connection_id = %id,
            subscription = ?subscription,
            "Subscribed"
        );
        conn.subscriptions.insert(subscription);
        Ok(())
    }

    /// Remove a subscription. Returns whether it was present.
    pub async fn unsubscribe(&self, id: ConnectionId, subscription: &Subscription) -> Result<bool> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))?;
        Ok(conn.subscriptions.remove(subscription))
    }

    /// Apply a client command and produce the reply for that client.
    pub async fn handle_client_message(
        &self,
        id: ConnectionId,
        message: ClientMessage,
    ) -> StandardMessage {
        let (request, subscribing) = match message {
            ClientMessage::Subscribe(req) => (req, true),
            ClientMessage::Unsubscribe(req) => (req, false),
        };
        let subscription = match Subscription::try_from(request) {
            Ok(s) => s,
            Err(e) => return StandardMessage::error(e.to_string()),
        };

        let result = if subscribing {
            self.subscribe(id, subscription.clone()).await
        } else {
            self.unsubscribe(id, &subscription).await.map(|_| ())
        };

        match result {
            Ok(()) => StandardMessage::ack(&subscription, subscribing),
            Err(e) => StandardMessage::error(e.to_string()),
        }
    }

    /// Parse a client text frame and apply it.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) -> StandardMessage {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_client_message(id, message).await,
            Err(e) => StandardMessage::error(e.to_string()),
        }
    }

    /// Queue a message for one connection without waiting.
    ///
    /// Returns `false` when the connection is gone or its queue is full.
    pub async fn send_to(&self, id: ConnectionId, message: StandardMessage) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&id) {
            Some(conn) => conn.tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Decode a broker message and deliver it.
    pub async fn deliver(&self, message: &BrokerMessage) -> FanoutReport {
        match Event::from_wire(&message.value) {
            Ok(event) => self.deliver_event(&event).await,
            Err(e) => {
                warn!(
                    subsystem = "realtime",
                    component = "fanout",
                    topic = %message.topic,
                    offset = %message.offset,
                    error = %e,
                    "Skipping undecodable event"
                );
                FanoutReport::default()
            }
        }
    }

    /// Deliver one event to every authorized, matching connection.
    pub async fn deliver_event(&self, event: &Event) -> FanoutReport {
        let outbound = EventMessage::from_event(event);
        let resource_type = outbound.resource_type;
        let resource_id = outbound.resource_id;

        let targets: Vec<(ConnectionId, Uuid, mpsc::Sender<StandardMessage>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, c)| c.subscriptions.iter().any(|s| s.matches(&outbound)))
                .map(|(id, c)| (*id, c.user_id, c.tx.clone()))
                .collect()
        };

        let mut report = FanoutReport {
            matched: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            trace!(event_id = %event.id, event = %event.name, "No subscribers");
            return report;
        }

        let message = StandardMessage::Event(outbound);
        let mut closed = Vec::new();

        for (conn_id, user_id, tx) in targets {
            match self
                .access
                .has_access(user_id, resource_id, resource_type, self.config.minimum_role)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    report.denied += 1;
                    debug!(
                        subsystem = "realtime",
                        component = "fanout",
                        connection_id = %conn_id,
                        user_id = %user_id,
                        resource_id = %resource_id,
                        "Delivery denied"
                    );
                    continue;
                }
                Err(e) => {
                    report.denied += 1;
                    warn!(
                        subsystem = "realtime",
                        component = "fanout",
                        connection_id = %conn_id,
                        user_id = %user_id,
                        resource_id = %resource_id,
                        error = %e,
                        "Access check failed; treating as denied"
                    );
                    continue;
                }
            }

            match tx.send_timeout(message.clone(), self.config.send_timeout).await {
                Ok(()) => report.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    report.dropped += 1;
                    warn!(
                        subsystem = "realtime",
                        component = "fanout",
                        connection_id = %conn_id,
                        event_id = %event.id,
                        "Outbound queue full; message dropped"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    report.failed += 1;
                    closed.push(conn_id);
                }
            }
        }

        if !closed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &closed {
                connections.remove(id);
                debug!(
                    subsystem = "realtime",
                    component = "fanout",
                    connection_id = %id,
                    "Removed closed connection"
                );
            }
        }

        debug!(
            subsystem = "realtime",
            component = "fanout",
            event_id = %event.id,
            event = %event.name,
            matched = report.matched,
            denied = report.denied,
            delivered = report.delivered,
            dropped = report.dropped,
            failed = report.failed,
            "Event fanned out"
        );
        report
    }

    /// Deliver every message from `stream` until it ends.
    pub async fn run(self: Arc<Self>, stream: MessageStream) {
        info!(
            subsystem = "realtime",
            component = "fanout",
            "Fanout loop started"
        );
        while let Some(message) = stream.recv().await {
            self.deliver(&message).await;
        }
        info!(
            subsystem = "realtime",
            component = "fanout",
            "Fanout loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{EntityType, Operation};
    use quire_db::MemoryAccessControl;
    use serde_json::json;

    fn service(access: Arc<MemoryAccessControl>) -> FanoutService {
        FanoutService::new(access, FanoutConfig::default().with_max_subscriptions(2))
    }

    #[tokio::test]
    async fn test_subscribe_ack_and_limit() {
        let fanout = service(Arc::new(MemoryAccessControl::new()));
        let (conn, _rx) = fanout.register(Uuid::new_v4()).await;

        let reply = fanout
            .handle_text(conn, r#"{"action":"subscribe","event":"task.completed"}"#)
            .await;
        assert_eq!(reply.kind(), "subscribe");

        let reply = fanout
            .handle_text(conn, r#"{"action":"subscribe","event":"note.created"}"#)
            .await;
        assert_eq!(reply.kind(), "subscribe");

        let reply = fanout
            .handle_text(conn, r#"{"action":"subscribe","event":"note.updated"}"#)
            .await;
        assert_eq!(reply.kind(), "error");
        assert_eq!(fanout.subscriptions(conn).await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply() {
        let fanout = service(Arc::new(MemoryAccessControl::new()));
        let (conn, _rx) = fanout.register(Uuid::new_v4()).await;

        let reply = fanout.handle_text(conn, "refresh").await;
        assert_eq!(reply.kind(), "error");
        let reply = fanout
            .handle_text(conn, r#"{"action":"subscribe","resource_type":"note"}"#)
            .await;
        assert_eq!(reply.kind(), "error");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = service(access.clone());
        let user = Uuid::new_v4();
        let note_id = Uuid::new_v4();
        access.grant(user, EntityType::Note, note_id, Role::Viewer).await;

        let (conn, mut rx) = fanout.register(user).await;
        let sub = Subscription::resource(EntityType::Note, note_id);
        fanout.subscribe(conn, sub.clone()).await.unwrap();

        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        assert_eq!(fanout.deliver_event(&event).await.delivered, 1);
        assert!(rx.try_recv().is_ok());

        assert!(fanout.unsubscribe(conn, &sub).await.unwrap());
        assert_eq!(fanout.deliver_event(&event).await.matched, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_receiver_removes_connection() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = service(access.clone());
        let user = Uuid::new_v4();
        let note_id = Uuid::new_v4();
        access.grant(user, EntityType::Note, note_id, Role::Owner).await;

        let (conn, rx) = fanout.register(user).await;
        fanout
            .subscribe(conn, Subscription::resource(EntityType::Note, note_id))
            .await
            .unwrap();
        drop(rx);

        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        let report = fanout.deliver_event(&event).await;
        assert_eq!(report.failed, 1);
        assert_eq!(fanout.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_resource_subscription_requires_viewer_access() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = service(access.clone());
        let note_id = Uuid::new_v4();
        let (reader, outsider) = (Uuid::new_v4(), Uuid::new_v4());
        access.grant(reader, EntityType::Note, note_id, Role::Viewer).await;

        let sub = Subscription::resource(EntityType::Note, note_id);
        let (reader_conn, mut reader_rx) = fanout.register(reader).await;
        let (outsider_conn, mut outsider_rx) = fanout.register(outsider).await;
        fanout.subscribe(reader_conn, sub.clone()).await.unwrap();
        fanout.subscribe(outsider_conn, sub).await.unwrap();

        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        let report = fanout.deliver_event(&event).await;
        assert_eq!(report.matched, 2);
        assert_eq!(report.denied, 1);
        assert_eq!(report.delivered, 1);

        let StandardMessage::Event(received) = reader_rx.try_recv().unwrap() else {
            panic!("expected an event message");
        };
        assert_eq!(received.id, event.id);
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_access_check_error_counts_as_denied() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = service(access.clone());
        let user = Uuid::new_v4();
        let note_id = Uuid::new_v4();
        access.grant(user, EntityType::Note, note_id, Role::Owner).await;

        let (conn, mut rx) = fanout.register(user).await;
        fanout
            .subscribe(conn, Subscription::resource(EntityType::Note, note_id))
            .await
            .unwrap();
        access.set_failing(true);

        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        let report = fanout.deliver_event(&event).await;
        assert_eq!(report.denied, 1);
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(fanout.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_revoked_access_stops_delivery() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = service(access.clone());
        let user = Uuid::new_v4();
        let note_id = Uuid::new_v4();
        access.grant(user, EntityType::Note, note_id, Role::Editor).await;

        let (conn, mut rx) = fanout.register(user).await;
        fanout
            .subscribe(conn, Subscription::resource(EntityType::Note, note_id))
            .await
            .unwrap();
        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        assert_eq!(fanout.deliver_event(&event).await.delivered, 1);
        assert!(rx.try_recv().is_ok());

        access.revoke(user, EntityType::Note, note_id).await;
        assert_eq!(fanout.deliver_event(&event).await.denied, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_outbound_queue_drops_for_that_connection_only() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = FanoutService::new(
            access.clone(),
            FanoutConfig::default()
                .with_outbound_capacity(1)
                .with_send_timeout(Duration::from_millis(20)),
        );
        let note_id = Uuid::new_v4();
        let (slow, fast) = (Uuid::new_v4(), Uuid::new_v4());
        access.grant(slow, EntityType::Note, note_id, Role::Viewer).await;
        access.grant(fast, EntityType::Note, note_id, Role::Viewer).await;

        let sub = Subscription::resource(EntityType::Note, note_id);
        let (slow_conn, mut slow_rx) = fanout.register(slow).await;
        let (fast_conn, mut fast_rx) = fanout.register(fast).await;
        fanout.subscribe(slow_conn, sub.clone()).await.unwrap();
        fanout.subscribe(fast_conn, sub).await.unwrap();

        let first =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        assert_eq!(fanout.deliver_event(&first).await.delivered, 2);
        assert!(fast_rx.try_recv().is_ok());

        let second =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        let report = fanout.deliver_event(&second).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(fanout.connection_count().await, 2);

        let StandardMessage::Event(received) = fast_rx.try_recv().unwrap() else {
            panic!("expected an event message");
        };
        assert_eq!(received.id, second.id);
        let StandardMessage::Event(queued) = slow_rx.try_recv().unwrap() else {
            panic!("expected an event message");
        };
        assert_eq!(queued.id, first.id);
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_minimum_role_is_configurable() {
        let access = Arc::new(MemoryAccessControl::new());
        let fanout = FanoutService::new(
            access.clone(),
            FanoutConfig::default().with_minimum_role(Role::Editor),
        );
        let note_id = Uuid::new_v4();
        let (viewer, editor) = (Uuid::new_v4(), Uuid::new_v4());
        access.grant(viewer, EntityType::Note, note_id, Role::Viewer).await;
        access.grant(editor, EntityType::Note, note_id, Role::Editor).await;

        let sub = Subscription::resource(EntityType::Note, note_id);
        let (viewer_conn, _viewer_rx) = fanout.register(viewer).await;
        let (editor_conn, _editor_rx) = fanout.register(editor).await;
        fanout.subscribe(viewer_conn, sub.clone()).await.unwrap();
        fanout.subscribe(editor_conn, sub).await.unwrap();

        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", note_id, &json!({})).unwrap();
        let report = fanout.deliver_event(&event).await;
        assert_eq!(report.denied, 1);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let fanout = service(Arc::new(MemoryAccessControl::new()));
        let report = fanout
            .deliver(&BrokerMessage::new("note-events", "k", b"not json".to_vec()))
            .await;
        assert_eq!(report, FanoutReport::default());
    }
}
