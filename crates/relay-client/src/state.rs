use std::fmt;

/// Connection lifecycle as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Failed => "failed",
        }
    }

    /// States from which a visibility edge may restart the connection.
    pub fn is_restartable(&self) -> bool {
        matches!(self, ClientState::Disconnected | ClientState::Failed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_wire_values() {
        assert_eq!(ClientState::Connecting.as_str(), "connecting");
        assert_eq!(ClientState::Reconnecting.as_str(), "reconnecting");
        assert_eq!(ClientState::Failed.as_str(), "failed");
    }

    #[test]
    fn only_idle_states_restart_on_visibility() {
        assert!(ClientState::Disconnected.is_restartable());
        assert!(ClientState::Failed.is_restartable());
        assert!(!ClientState::Connected.is_restartable());
        assert!(!ClientState::Reconnecting.is_restartable());
    }
}
