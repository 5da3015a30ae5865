//! Error types for resilience primitives.

use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Outcome of a call made through a [`CircuitBreaker`](crate::CircuitBreaker).
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit is {state}; retry after {retry_after:?}")]
    Open {
        /// State at the time of rejection.
        state: CircuitState,
        /// Time until the breaker will admit a probe.
        retry_after: Duration,
    },

    /// The guarded operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Check if this is a rejection by the breaker.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The inner error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_open() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Open {
            state: CircuitState::Open,
            retry_after: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("OPEN"));
        assert!(msg.contains("1.5s"));
        assert!(err.is_open());
    }

    #[test]
    fn test_error_display_inner() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Inner("backend down".into());
        assert_eq!(err.to_string(), "backend down");
        assert!(!err.is_open());
        assert_eq!(err.into_inner().as_deref(), Some("backend down"));
    }

    #[test]
    fn test_error_display_config() {
        let err = ResilienceError::Config("failure_threshold must be at least 1".into());
        assert!(err.to_string().contains("failure_threshold"));
    }
}
