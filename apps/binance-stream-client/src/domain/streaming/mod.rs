//! Stream Connection State
//!
//! Lifecycle of the single stream connection:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Connected
//!       ▲                        │                   │
//!       └──────── closed / failure ◄─────────────────┘
//! ```

use std::fmt;

use serde::Serialize;

/// Stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and none being established.
    #[default]
    Disconnected,
    /// Dialling; the open event has not arrived yet.
    Connecting,
    /// Open; control requests go straight to the wire.
    Connected,
}

impl ConnectionState {
    /// Lowercase name used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    /// Whether the connection is open.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connecting).unwrap(),
            "\"connecting\""
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }
}
