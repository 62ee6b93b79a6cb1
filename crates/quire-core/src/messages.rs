//! WebSocket client protocol: outbound [`StandardMessage`] envelope and
//! inbound [`ClientMessage`] commands.
//!
//! ## Wire Format
//!
//! Inbound:
//!
//! ```text
//! {"action":"subscribe","resource_type":"note","resource_id":"<uuid>"}
//! {"action":"subscribe","event":"task.completed"}
//! {"action":"unsubscribe", ...same shapes...}
//! ```
//!
//! Outbound (tagged by `type`):
//!
//! ```text
//! {"type":"event","id":"...","event":"note.created","timestamp":"...",
//!  "payload":{...},"resource_id":"...","resource_type":"note"}
//! {"type":"subscribe","id":"...","timestamp":"...","payload":{"status":"subscribed",...}}
//! {"type":"error","id":"...","timestamp":"...","payload":{"message":"..."}}
//! ```
//!
//! Inbound requests are validated into a [`Subscription`] at the boundary, so
//! the fanout service never sees a half-specified subscription.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EntityType, Event};

// ============================================================================
// Outbound
// ============================================================================

/// Outbound envelope pushed to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StandardMessage {
    /// A domain event the connection is subscribed to.
    Event(EventMessage),
    /// Acknowledgement of a subscribe/unsubscribe request.
    Subscribe(AckMessage),
    /// A rejected client request.
    Error(ErrorMessage),
}

/// Domain event delivered to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: Uuid,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, JsonValue>,
    pub resource_id: Uuid,
    pub resource_type: EntityType,
}

impl EventMessage {
    /// Wrap an outbox event for delivery.
    ///
    /// Non-object payloads are placed under a `value` key so the outbound
    /// payload is always a map.
    pub fn from_event(event: &Event) -> Self {
        let payload = match &event.payload {
            JsonValue::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        let (resource_type, resource_id) = event.resource();
        Self {
            id: event.id,
            event: event.name.clone(),
            timestamp: event.timestamp,
            payload,
            resource_id,
            resource_type,
        }
    }
}

/// Subscription acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, JsonValue>,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, JsonValue>,
}

impl StandardMessage {
    pub fn event(event: &Event) -> Self {
        StandardMessage::Event(EventMessage::from_event(event))
    }

    /// Ack for a subscribe (`subscribed = true`) or unsubscribe request.
    pub fn ack(subscription: &Subscription, subscribed: bool) -> Self {
        let mut payload = Map::new();
        payload.insert(
            "status".to_string(),
            JsonValue::from(if subscribed { "subscribed" } else { "unsubscribed" }),
        );
        match subscription {
            Subscription::Resource {
                resource_type,
                resource_id,
            } => {
                payload.insert("resource_type".to_string(), resource_type.as_str().into());
                payload.insert("resource_id".to_string(), resource_id.to_string().into());
            }
            Subscription::Event { event } => {
                payload.insert("event".to_string(), event.clone().into());
            }
        }
        StandardMessage::Subscribe(AckMessage {
            id: crate::uuid_utils::new_v7(),
            timestamp: Utc::now(),
            payload,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), JsonValue::from(message.into()));
        StandardMessage::Error(ErrorMessage {
            id: crate::uuid_utils::new_v7(),
            timestamp: Utc::now(),
            payload,
        })
    }

    /// The `type` tag value.
    pub fn kind(&self) -> &'static str {
        match self {
            StandardMessage::Event(_) => "event",
            StandardMessage::Subscribe(_) => "subscribe",
            StandardMessage::Error(_) => "error",
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A validated subscription held by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// All events for one resource.
    Resource {
        resource_type: EntityType,
        resource_id: Uuid,
    },
    /// All events with a given name, e.g. `task.completed`.
    Event { event: String },
}

impl Subscription {
    pub fn resource(resource_type: EntityType, resource_id: Uuid) -> Self {
        Subscription::Resource {
            resource_type,
            resource_id,
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Subscription::Event { event: name.into() }
    }

    pub fn matches(&self, message: &EventMessage) -> bool {
        match self {
            Subscription::Resource {
                resource_type,
                resource_id,
            } => *resource_type == message.resource_type && *resource_id == message.resource_id,
            Subscription::Event { event } => *event == message.event,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Raw subscribe/unsubscribe body as sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl TryFrom<SubscriptionRequest> for Subscription {
    type Error = Error;

    fn try_from(req: SubscriptionRequest) -> Result<Self> {
        match (req.resource_type, req.resource_id, req.event) {
            (Some(rt), Some(rid), None) => {
                let resource_type = rt.parse::<EntityType>()?;
                let resource_id = Uuid::parse_str(&rid)
                    .map_err(|e| Error::InvalidInput(format!("invalid resource_id: {e}")))?;
                Ok(Subscription::resource(resource_type, resource_id))
            }
            (None, None, Some(event)) => {
                let event = event.trim();
                if event.is_empty() {
                    return Err(Error::InvalidInput("event must not be empty".to_string()));
                }
                Ok(Subscription::event(event))
            }
            (None, None, None) => Err(Error::InvalidInput(
                "subscription requires resource_type/resource_id or event".to_string(),
            )),
            _ => Err(Error::InvalidInput(
                "subscription must name either a resource or an event, not both".to_string(),
            )),
        }
    }
}

/// Inbound command from a WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
}

impl ClientMessage {
    /// Parse a client text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("malformed client message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Operation;
    use serde_json::json;

    #[test]
    fn test_parse_resource_subscribe() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"action":"subscribe","resource_type":"note","resource_id":"{id}"}}"#);
        let msg = ClientMessage::parse(&text).unwrap();
        let ClientMessage::Subscribe(req) = msg else {
            panic!("expected subscribe");
        };
        let sub = Subscription::try_from(req).unwrap();
        assert_eq!(sub, Subscription::resource(EntityType::Note, id));
    }

    #[test]
    fn test_parse_event_unsubscribe() {
        let msg = ClientMessage::parse(r#"{"action":"unsubscribe","event":"task.completed"}"#)
            .unwrap();
        let ClientMessage::Unsubscribe(req) = msg else {
            panic!("expected unsubscribe");
        };
        assert_eq!(
            Subscription::try_from(req).unwrap(),
            Subscription::event("task.completed")
        );
    }

    #[test]
    fn test_reject_unknown_action() {
        assert!(ClientMessage::parse(r#"{"action":"publish","event":"x"}"#).is_err());
        assert!(ClientMessage::parse("refresh").is_err());
    }

    #[test]
    fn test_reject_incomplete_subscription() {
        let req = SubscriptionRequest {
            resource_type: Some("note".to_string()),
            ..Default::default()
        };
        assert!(Subscription::try_from(req).is_err());

        assert!(Subscription::try_from(SubscriptionRequest::default()).is_err());

        let bad_id = SubscriptionRequest {
            resource_type: Some("note".to_string()),
            resource_id: Some("not-a-uuid".to_string()),
            event: None,
        };
        assert!(matches!(
            Subscription::try_from(bad_id),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reject_mixed_subscription() {
        let req = SubscriptionRequest {
            resource_type: Some("note".to_string()),
            resource_id: Some(Uuid::new_v4().to_string()),
            event: Some("note.created".to_string()),
        };
        assert!(Subscription::try_from(req).is_err());
    }

    #[test]
    fn test_event_message_serialization() {
        let note_id = Uuid::new_v4();
        let event = Event::pending(
            EntityType::Note,
            Operation::Create,
            "user-1",
            note_id,
            &json!({"title": "Hello"}),
        )
        .unwrap();
        let msg = StandardMessage::event(&event);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "note.created");
        assert_eq!(value["resource_type"], "note");
        assert_eq!(value["resource_id"], note_id.to_string());
        assert_eq!(value["payload"]["title"], "Hello");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_non_object_payload_wrapped() {
        let event = Event::pending(
            EntityType::Task,
            Operation::Delete,
            "user-1",
            Uuid::new_v4(),
            &json!(42),
        )
        .unwrap();
        let msg = EventMessage::from_event(&event);
        assert_eq!(msg.payload.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_ack_and_error_tags() {
        let ack = StandardMessage::ack(&Subscription::event("note.created"), true);
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["status"], "subscribed");
        assert_eq!(value["payload"]["event"], "note.created");

        let err = StandardMessage::error("nope");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["message"], "nope");
        assert_eq!(err.kind(), "error");
    }

    #[test]
    fn test_subscription_matching() {
        let id = Uuid::new_v4();
        let event =
            Event::pending(EntityType::Note, Operation::Update, "u", id, &json!({})).unwrap();
        let msg = EventMessage::from_event(&event);

        assert!(Subscription::resource(EntityType::Note, id).matches(&msg));
        assert!(!Subscription::resource(EntityType::Task, id).matches(&msg));
        assert!(!Subscription::resource(EntityType::Note, Uuid::new_v4()).matches(&msg));
        assert!(Subscription::event("note.updated").matches(&msg));
        assert!(!Subscription::event("note.created").matches(&msg));
    }
}
