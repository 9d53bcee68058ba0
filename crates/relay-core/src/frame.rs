use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock;
use crate::errors::GatewayError;
use crate::ids::UserId;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reserved frame types. Anything else is an application frame the gateway
/// forwards without interpreting.
pub mod kind {
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const CONNECTION_STATE: &str = "connection_state";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const AUTH: &str = "auth";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const ERROR: &str = "error";
    pub const RECONNECTING: &str = "reconnecting";
    pub const CONNECTION_FAILED: &str = "connection_failed";
}

/// One JSON message exchanged over the gateway: a mandatory `type`
/// discriminator, an optional epoch-ms timestamp, and arbitrary
/// type-specific fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Frame {
    /// A frame of the given type, stamped with the current wall clock.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Some(clock::now_ms()),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn ping() -> Self {
        Self::new(kind::PING)
    }

    pub fn pong() -> Self {
        Self::new(kind::PONG)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(kind::ERROR).with_field("message", message.into())
    }

    pub fn connection_established(user: &UserId, server_version: &str) -> Self {
        Self::new(kind::CONNECTION_ESTABLISHED)
            .with_field("user", user.as_str())
            .with_field("serverVersion", server_version)
    }

    pub fn connection_state(state: &str, seq: u64) -> Self {
        Self::new(kind::CONNECTION_STATE)
            .with_field("state", state)
            .with_field("seq", seq)
    }

    pub fn reconnecting(attempt: u32, max_attempts: u32, next_attempt_in_ms: u64) -> Self {
        Self::new(kind::RECONNECTING)
            .with_field("attempt", attempt)
            .with_field("maxAttempts", max_attempts)
            .with_field("nextAttemptIn", next_attempt_in_ms)
    }

    pub fn connection_failed() -> Self {
        Self::new(kind::CONNECTION_FAILED)
    }

    pub fn session_expired() -> Self {
        Self::new(kind::SESSION_EXPIRED)
    }

    pub fn auth(user: &UserId, is_authenticated: bool) -> Self {
        Self::new(kind::AUTH)
            .with_field("user", user.as_str())
            .with_field("isAuthenticated", is_authenticated)
    }
}

/// Transforms between in-memory frames and wire text, enforcing the
/// configured size limit in both directions.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { max_frame_bytes: DEFAULT_MAX_FRAME_BYTES }
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn encode(&self, frame: &Frame) -> Result<String, GatewayError> {
        let wire = serde_json::to_string(frame)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        if wire.len() > self.max_frame_bytes {
            return Err(GatewayError::FrameTooLarge {
                limit: self.max_frame_bytes,
                actual: wire.len(),
            });
        }
        Ok(wire)
    }

    pub fn decode(&self, wire: &str) -> Result<Frame, GatewayError> {
        if wire.len() > self.max_frame_bytes {
            return Err(GatewayError::FrameTooLarge {
                limit: self.max_frame_bytes,
                actual: wire.len(),
            });
        }
        let frame: Frame = serde_json::from_str(wire)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        if frame.kind.is_empty() {
            return Err(GatewayError::Malformed("empty type".into()));
        }
        Ok(frame)
    }
}
