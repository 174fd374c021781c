//! # Push Events
//!
//! Topic names and the event frame delivered by the push channel.
//!
//! ## Event Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  { "topic": "orders", "entityId": "ord-42", "kind": "update",          │
//! │    "payload": { "id": "ord-42", "status": "shipped", ... } }           │
//! │                                                                         │
//! │  topic     routes the event to interested cache keys                   │
//! │  entityId  absent for collection-wide events                           │
//! │  kind      insert | update | delete | invalidate                       │
//! │  payload   full entity for insert/update, usually absent otherwise     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

// =============================================================================
// Topic
// =============================================================================

/// Opaque push channel topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub const DASHBOARD: &'static str = "dashboard";
    pub const ORDERS: &'static str = "orders";
    pub const ACTIVITY: &'static str = "activity";
    pub const SALES_CHANNELS: &'static str = "sales-channels";
    pub const SECURITY: &'static str = "security";
    pub const PRODUCTS: &'static str = "products";
    pub const INVENTORY: &'static str = "inventory";
    pub const CUSTOMERS: &'static str = "customers";
    pub const RETURNS: &'static str = "returns";
    pub const WORKFLOWS: &'static str = "workflows";

    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic(value.to_string())
    }
}

// =============================================================================
// Push Event
// =============================================================================

/// What happened to the entity named by a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[serde(alias = "Insert", alias = "created")]
    Insert,
    #[serde(alias = "Update", alias = "updated")]
    Update,
    #[serde(alias = "Delete", alias = "deleted")]
    Delete,
    #[serde(alias = "Invalidate")]
    Invalidate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Insert => write!(f, "insert"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
            EventKind::Invalidate => write!(f, "invalidate"),
        }
    }
}

/// A server-originated change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub payload: Option<Value>,
}

impl PushEvent {
    pub fn invalidate(topic: impl Into<Topic>) -> Self {
        PushEvent {
            topic: topic.into(),
            entity_id: None,
            kind: EventKind::Invalidate,
            payload: None,
        }
    }

    pub fn upsert(topic: impl Into<Topic>, id: impl Into<String>, payload: Value) -> Self {
        PushEvent {
            topic: topic.into(),
            entity_id: Some(id.into()),
            kind: EventKind::Update,
            payload: Some(payload),
        }
    }

    pub fn delete(topic: impl Into<Topic>, id: impl Into<String>) -> Self {
        PushEvent {
            topic: topic.into(),
            entity_id: Some(id.into()),
            kind: EventKind::Delete,
            payload: None,
        }
    }

    /// Entity id from the frame, or from `payload.id` when the server only
    /// put it inside the payload.
    pub fn resolved_entity_id(&self) -> Option<String> {
        if let Some(id) = &self.entity_id {
            return Some(id.clone());
        }
        match self.payload.as_ref()?.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
