//! Error types for the RPC client.

use std::time::Duration;

use claw_proto::{ErrorShape, ProtoError};
use thiserror::Error;

/// Errors returned by [`RpcClient`](crate::RpcClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was stopped while the call was pending, or before it.
    #[error("client stopped")]
    Stopped,

    /// No connection is currently established.
    #[error("not connected to gateway")]
    NotConnected,

    /// No response arrived in time.
    #[error("request {method} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Method of the request.
        method: String,
        /// How long the client waited.
        timeout: Duration,
    },

    /// The encoded request exceeds the gateway's payload limit.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Encoded size.
        size: usize,
        /// Limit advertised by the gateway.
        limit: usize,
    },

    /// The gateway answered with an error.
    #[error("{0}")]
    Remote(ErrorShape),

    /// The handshake was rejected or did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport could not be opened or broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Frame encoding or protocol negotiation failed.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl ClientError {
    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Stopped => "CLIENT_STOPPED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Remote(shape) => &shape.code,
            Self::Handshake(_) => "HANDSHAKE_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Config(_) => "INVALID_CONFIG",
            Self::Proto(_) => "PROTOCOL_ERROR",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
