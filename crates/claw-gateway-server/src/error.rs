//! Error types for the gateway server.

use std::net::SocketAddr;

use claw_proto::ProtoError;
use thiserror::Error;

/// Errors that can occur in the gateway server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Failed to serialize or deserialize a frame.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer did not complete the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Frame exceeded the negotiated payload limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<ProtoError> for ServerError {
    fn from(err: ProtoError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
