//! Wire messages exchanged with the aggregator.
//!
//! Outbound: `{type, data, timestamp, priority}`. Inbound: `{type, data}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery class of an outbound message.
///
/// Only [`Priority::High`] messages are held for replay while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundKind {
    Ping,
    Authenticate,
    Register,
    Metrics,
    Status,
    TaskResult,
    TaskError,
    RewardIssued,
    Disconnect,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Authenticate => "authenticate",
            Self::Register => "register",
            Self::Metrics => "metrics",
            Self::Status => "status",
            Self::TaskResult => "taskResult",
            Self::TaskError => "taskError",
            Self::RewardIssued => "rewardIssued",
            Self::Disconnect => "disconnect",
        }
    }

    /// Whether at most one pending copy of this type is kept.
    pub(crate) fn dedupes_on_type(self) -> bool {
        matches!(self, Self::Authenticate | Self::Register)
    }
}

impl std::fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message queued or sent to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub data: Value,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: i64,
    pub priority: Priority,
    /// Pending-queue dedupe key; never sent on the wire.
    #[serde(skip)]
    pub dedupe_key: Option<String>,
}

impl OutboundMessage {
    pub fn new(kind: OutboundKind, data: Value, priority: Priority) -> Self {
        let dedupe_key = kind.dedupes_on_type().then(|| kind.as_str().to_owned());
        Self {
            kind,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            priority,
            dedupe_key,
        }
    }

    /// Replace any pending message with the same type and key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::error::AgentError::Protocol(format!("cannot encode {}: {e}", self.kind)))
    }
}

/// A raw inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundMessage {
    /// # Errors
    ///
    /// Returns an error if the frame is not a `{type, data}` JSON object.
    pub fn parse(text: &str) -> crate::error::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::error::AgentError::Protocol(format!("malformed frame: {e}")))
    }
}

/// Inbound message types with a registered meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    AuthResponse,
    Pong,
    RequestMetrics,
    Reward,
    Task,
    ServerShutdown,
}

impl InboundKind {
    pub const ALL: [InboundKind; 6] = [
        InboundKind::AuthResponse,
        InboundKind::Pong,
        InboundKind::RequestMetrics,
        InboundKind::Reward,
        InboundKind::Task,
        InboundKind::ServerShutdown,
    ];

    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "authResponse" => Some(Self::AuthResponse),
            "pong" => Some(Self::Pong),
            "requestMetrics" => Some(Self::RequestMetrics),
            "reward" => Some(Self::Reward),
            "task" => Some(Self::Task),
            "serverShutdown" => Some(Self::ServerShutdown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthResponse => "authResponse",
            Self::Pong => "pong",
            Self::RequestMetrics => "requestMetrics",
            Self::Reward => "reward",
            Self::Task => "task",
            Self::ServerShutdown => "serverShutdown",
        }
    }
}
