//! Connection state.

use std::fmt;

/// State of the client's gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, waiting for `hello-ok`.
    Handshaking,
    /// Handshake accepted.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Stopped for good.
    Stopped,
}

impl ConnectionState {
    /// Lowercase name, for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `stop()` has been called.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
