//! Error types for the gateway registry.

use std::fmt;
use std::time::Duration;

use claw_proto::{ErrorShape, InvokeErrorShape};
use serde_json::Value;
use thiserror::Error;

/// Registry setup errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for registry setup.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Why an invoke did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvokeErrorCode {
    /// No connected node has the requested id.
    NodeNotFound,
    /// The node's pending-call set is full.
    QueueFull,
    /// The node did not reply in time.
    Timeout,
    /// The node disconnected before replying.
    NodeDisconnected,
    /// The request could not be encoded.
    InvalidRequest,
    /// The node's circuit breaker is open.
    CircuitOpen,
    /// The node ran the command and reported a failure.
    Remote(String),
}

impl InvokeErrorCode {
    /// Wire code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::QueueFull => "QUEUE_FULL",
            Self::Timeout => "TIMEOUT",
            Self::NodeDisconnected => "NODE_DISCONNECTED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Remote(code) => code,
        }
    }

    /// Whether the code indicates an unhealthy node rather than a caller
    /// or command problem.
    #[must_use]
    pub const fn is_node_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::NodeDisconnected)
    }

    /// Whether retrying the same invoke later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::Timeout | Self::NodeDisconnected | Self::CircuitOpen
        )
    }
}

impl fmt::Display for InvokeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed outcome of an invoke.
///
/// These are expected outcomes of normal operation and are returned as
/// values, never panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct InvokeError {
    /// Failure kind.
    pub code: InvokeErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Suggested back-off, if any.
    pub retry_after: Option<Duration>,
}

impl InvokeError {
    /// Create an error.
    #[must_use]
    pub fn new(code: InvokeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub(crate) fn node_not_found(node_id: &str) -> Self {
        Self::new(
            InvokeErrorCode::NodeNotFound,
            format!("node {node_id} is not connected"),
        )
    }

    pub(crate) fn queue_full(node_id: &str, max: usize) -> Self {
        Self::new(
            InvokeErrorCode::QueueFull,
            format!("node {node_id} has {max} pending invokes"),
        )
    }

    pub(crate) fn timeout(command: &str, timeout: Duration) -> Self {
        Self::new(
            InvokeErrorCode::Timeout,
            format!("{command} timed out after {}ms", timeout.as_millis()),
        )
    }

    pub(crate) fn node_disconnected(node_id: &str) -> Self {
        Self::new(
            InvokeErrorCode::NodeDisconnected,
            format!("node {node_id} disconnected"),
        )
    }

    pub(crate) fn circuit_open(node_id: &str, retry_after: Duration) -> Self {
        Self {
            code: InvokeErrorCode::CircuitOpen,
            message: format!(
                "circuit open for node {node_id}; retry after {}ms",
                retry_after.as_millis()
            ),
            retry_after: Some(retry_after),
        }
    }

    pub(crate) fn remote(error: Option<&InvokeErrorShape>) -> Self {
        match error {
            Some(shape) => Self::new(InvokeErrorCode::Remote(shape.code.clone()), &shape.message),
            None => Self::new(
                InvokeErrorCode::Remote("UNAVAILABLE".to_string()),
                "node reported failure without detail",
            ),
        }
    }

    /// Render as a response error body.
    #[must_use]
    pub fn to_error_shape(&self) -> ErrorShape {
        let mut shape = ErrorShape::new(self.code.as_str(), &self.message);
        shape.retryable = Some(self.code.is_retryable());
        if let Some(retry_after) = self.retry_after {
            shape = shape.with_retry_after(retry_after.as_millis() as u64);
        }
        shape
    }
}

/// Outcome of an invoke: the node's payload or why there is none.
pub type InvokeResult = Result<Value, InvokeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ==================== Code Tests ====================

    #[test_case(InvokeErrorCode::NodeNotFound, "NODE_NOT_FOUND" ; "node not found")]
    #[test_case(InvokeErrorCode::QueueFull, "QUEUE_FULL" ; "queue full")]
    #[test_case(InvokeErrorCode::Timeout, "TIMEOUT" ; "timeout")]
    #[test_case(InvokeErrorCode::NodeDisconnected, "NODE_DISCONNECTED" ; "disconnected")]
    #[test_case(InvokeErrorCode::CircuitOpen, "CIRCUIT_OPEN" ; "circuit open")]
    #[test_case(InvokeErrorCode::Remote("E_DISK".into()), "E_DISK" ; "remote")]
    fn test_code_as_str(code: InvokeErrorCode, expected: &str) {
        assert_eq!(code.as_str(), expected);
        assert_eq!(code.to_string(), expected);
    }

    #[test]
    fn test_node_failure_classification() {
        assert!(InvokeErrorCode::Timeout.is_node_failure());
        assert!(InvokeErrorCode::NodeDisconnected.is_node_failure());
        assert!(!InvokeErrorCode::QueueFull.is_node_failure());
        assert!(!InvokeErrorCode::NodeNotFound.is_node_failure());
        assert!(!InvokeErrorCode::Remote("X".into()).is_node_failure());
    }

    // ==================== InvokeError Tests ====================

    #[test]
    fn test_error_display() {
        let err = InvokeError::node_not_found("gpu-7");
        assert_eq!(err.to_string(), "NODE_NOT_FOUND: node gpu-7 is not connected");
    }

    #[test]
    fn test_remote_without_detail() {
        let err = InvokeError::remote(None);
        assert_eq!(err.code.as_str(), "UNAVAILABLE");
    }

    #[test]
    fn test_to_error_shape() {
        let shape = InvokeError::timeout("system.run", Duration::from_millis(1500)).to_error_shape();
        assert_eq!(shape.code, "TIMEOUT");
        assert!(shape.message.contains("1500ms"));
        assert_eq!(shape.retryable, Some(true));
        assert!(shape.retry_after_ms.is_none());

        let shape = InvokeError::circuit_open("n1", Duration::from_secs(2)).to_error_shape();
        assert_eq!(shape.code, "CIRCUIT_OPEN");
        assert_eq!(shape.retry_after_ms, Some(2000));
    }
}
