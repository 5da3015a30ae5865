//! Error types for the claw-proto crate.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A frame arrived that is not valid at this point of the exchange.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// No protocol version is acceptable to both sides.
    #[error("protocol mismatch: client supports {client_min}..={client_max}, server supports {server_min}..={server_max}")]
    ProtocolMismatch {
        /// Lowest version the client accepts.
        client_min: u32,
        /// Highest version the client accepts.
        client_max: u32,
        /// Lowest version the server accepts.
        server_min: u32,
        /// Highest version the server accepts.
        server_max: u32,
    },

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
