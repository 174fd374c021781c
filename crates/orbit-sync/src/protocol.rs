//! # Push Channel Protocol
//!
//! Frames exchanged over the push channel WebSocket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Push Channel Frames                                 │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  Client ───► GET ws_url  (Authorization: Bearer <push token>)          │
//! │  Server ◄─── 101 Switching Protocols                                   │
//! │                                                                         │
//! │  TOPICS (sent on every (re)connect, then on each change)               │
//! │  ──────                                                                │
//! │  Client ───► Subscribe   { topics: ["orders", "dashboard"] }           │
//! │  Client ───► Unsubscribe { topics: ["orders"] }                        │
//! │  Server ───► Subscribed  { topics: [...] }              (optional ack) │
//! │                                                                         │
//! │  EVENTS                                                                │
//! │  ──────                                                                │
//! │  Server ───► { topic, entityId?, kind, payload? }       (bare object)  │
//! │                                                                         │
//! │  KEEPALIVE / ERROR                                                     │
//! │  ─────────────────                                                     │
//! │  Client ───► Ping { timestamp }                                        │
//! │  Server ───► Pong { timestamp }                                        │
//! │  Server ───► Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Client frames and server control frames are adjacently tagged:
//! ```json
//! { "type": "Subscribe", "payload": { "topics": ["orders"] } }
//! ```
//! Server events are bare [`PushEvent`] objects.

use orbit_core::{PushEvent, Topic};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Client → Server
// =============================================================================

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Register interest in topics.
    Subscribe(TopicsPayload),

    /// Drop interest in topics.
    Unsubscribe(TopicsPayload),

    /// Application-level keepalive.
    Ping { timestamp: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicsPayload {
    pub topics: Vec<Topic>,
}

impl ClientMessage {
    pub fn subscribe(topics: impl IntoIterator<Item = Topic>) -> Self {
        ClientMessage::Subscribe(TopicsPayload {
            topics: topics.into_iter().collect(),
        })
    }

    pub fn unsubscribe(topics: impl IntoIterator<Item = Topic>) -> Self {
        ClientMessage::Unsubscribe(TopicsPayload {
            topics: topics.into_iter().collect(),
        })
    }

    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Returns the message type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe(_) => "Subscribe",
            ClientMessage::Unsubscribe(_) => "Unsubscribe",
            ClientMessage::Ping { .. } => "Ping",
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::SerializationFailed(e.to_string()))
    }
}

// =============================================================================
// Server → Client
// =============================================================================

/// Control frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    Subscribed(TopicsPayload),
    Pong { timestamp: String },
    Error { code: String, message: String },
}

/// Any frame the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Control(ControlMessage),
    Event(PushEvent),
}

impl ServerFrame {
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Returns the frame type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerFrame::Control(ControlMessage::Subscribed(_)) => "Subscribed",
            ServerFrame::Control(ControlMessage::Pong { .. }) => "Pong",
            ServerFrame::Control(ControlMessage::Error { .. }) => "Error",
            ServerFrame::Event(_) => "Event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::EventKind;

    #[test]
    fn test_subscribe_wire_shape() {
        let msg = ClientMessage::subscribe([Topic::from("orders"), Topic::from("dashboard")]);
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"Subscribe","payload":{"topics":["orders","dashboard"]}}"#
        );
        assert_eq!(msg.type_name(), "Subscribe");
    }

    #[test]
    fn test_parse_bare_event() {
        let frame = ServerFrame::from_json(
            r#"{"topic":"orders","entityId":"ord-9","kind":"delete"}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Event(event) => {
                assert_eq!(event.kind, EventKind::Delete);
                assert_eq!(event.entity_id.as_deref(), Some("ord-9"));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        let frame =
            ServerFrame::from_json(r#"{"type":"Error","payload":{"code":"FORBIDDEN","message":"no access to security"}}"#)
                .unwrap();
        assert_eq!(frame.type_name(), "Error");

        let frame = ServerFrame::from_json(r#"{"type":"Pong","payload":{"timestamp":"t"}}"#).unwrap();
        assert_eq!(frame.type_name(), "Pong");
    }

    #[test]
    fn test_garbage_is_invalid_message() {
        let err = ServerFrame::from_json(r#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }
}
