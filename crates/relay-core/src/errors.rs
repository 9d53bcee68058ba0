/// Typed error hierarchy for gateway operations, shared by server and client.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds {limit} bytes: {actual}")]
    FrameTooLarge { limit: usize, actual: usize },
    #[error("unsupported message kind: {0}")]
    Unsupported(&'static str),
    #[error("missing user identity")]
    AuthMissing,
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("reconnect policy exhausted after {attempts} attempts")]
    PolicyExhausted { attempts: u32 },
    #[error("session expired")]
    SessionExpired,
    #[error("gateway is shutting down")]
    Shutdown,
    #[error("connection send queue closed")]
    QueueClosed,
}

impl GatewayError {
    /// Errors the client responds to by entering the reconnect path.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::HeartbeatTimeout | Self::SessionExpired
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Unsupported(_) => "unsupported",
            Self::AuthMissing => "auth_missing",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Transport(_) => "transport",
            Self::PolicyExhausted { .. } => "policy_exhausted",
            Self::SessionExpired => "session_expired",
            Self::Shutdown => "shutdown",
            Self::QueueClosed => "queue_closed",
        }
    }
}
