//! Connection lifecycle state.

use serde::{Deserialize, Serialize};

/// State of the shared duplex connection.
///
/// ```text
/// Disconnected -> Connecting -> Open -> Closing -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport; a reconnect may be scheduled.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Transport established; frames flow in both directions.
    Open,
    /// Intentional teardown in progress.
    Closing,
}

impl ConnectionState {
    /// Check whether frames can be sent.
    #[must_use]
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// Short lowercase label, used for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::default().is_open());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Open).expect("serialize");
        assert_eq!(json, "\"open\"");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
