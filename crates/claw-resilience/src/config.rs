//! Configuration for breakers and limiters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};

/// Configuration for a [`CircuitBreaker`](crate::CircuitBreaker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the number of concurrent half-open probes.
    #[must_use]
    pub const fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is zero.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(ResilienceError::Config(
                "half_open_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`SlidingWindowRateLimiter`](crate::SlidingWindowRateLimiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admissions per key within the window. Zero admits nothing.
    pub max_requests: u32,
    /// Trailing window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Create a config.
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the window is empty.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.window.is_zero() {
            return Err(ResilienceError::Config("window must be non-zero".to_string()));
        }
        Ok(())
    }
}
