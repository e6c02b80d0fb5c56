//! Connection state shared between the transport and its observers.

use std::fmt;

use serde::Serialize;

/// State of the single shared control connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is open.
    Connected,
    /// The last attempt or the live connection failed.
    Error,
}

impl ConnectionState {
    /// Whether the connection is open.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
