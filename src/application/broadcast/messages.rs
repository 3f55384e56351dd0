//! Wire envelopes exchanged with streaming clients.
//!
//! Client messages and control messages are tagged by `type`. Domain events
//! carry an `event_id` cursor alongside their `type`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replay cursor. Strictly increasing over the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Ping,
    Sync {
        #[serde(default)]
        last_event_id: Option<EventId>,
        #[serde(default)]
        symbols: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SignalCreated,
    PositionOpened,
    PositionClosed,
    PositionUpdated,
    PerformanceSnapshot,
}

impl EventKind {
    /// Kinds routed by symbol and kept in the per-symbol history.
    pub fn is_symbol_scoped(&self) -> bool {
        !matches!(self, EventKind::PerformanceSnapshot)
    }
}

/// One domain event as sent and as retained for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    AuthTimeout,
    InvalidJson,
    InvalidMessage,
    PermissionDenied,
    SyncFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartbeatData {
    Pong,
    SyncComplete { resent_count: usize },
    SyncFallback { reason: String, resent_count: usize },
}

/// Server messages that never enter the replay history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ConnectionEstablished {
        client_id: String,
        user: String,
        role: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<HeartbeatData>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    SubscribeAck {
        symbols: Vec<String>,
    },
    UnsubscribeAck {
        symbols: Vec<String>,
    },
}

impl ControlMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ControlMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn heartbeat(data: Option<HeartbeatData>) -> Self {
        ControlMessage::Heartbeat {
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Anything the server may put on the wire; used by clients to decode frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(Event),
    Control(ControlMessage),
}
