use async_trait::async_trait;

use relay_core::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Invalid,
}

/// Host-supplied session check, polled periodically while connected. Probe
/// failures are treated as "probably valid" and are never fatal.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self) -> Result<SessionStatus, GatewayError>;
}

/// Default validator for hosts without a session backend.
pub struct AlwaysValid;

#[async_trait]
impl SessionValidator for AlwaysValid {
    async fn validate(&self) -> Result<SessionStatus, GatewayError> {
        Ok(SessionStatus::Valid)
    }
}
