//! # claw-resilience
//!
//! Failure isolation and admission control for gateway traffic.
//!
//! - [`CircuitBreaker`] - Three-state breaker guarding calls to an unhealthy target
//! - [`SlidingWindowRateLimiter`] - Per-key admission over a trailing time window
//!
//! # Example
//!
//! ```rust
//! use claw_resilience::{RateLimitConfig, SlidingWindowRateLimiter};
//! use std::time::Duration;
//!
//! let limiter = SlidingWindowRateLimiter::new(RateLimitConfig {
//!     max_requests: 2,
//!     window: Duration::from_secs(1),
//! });
//!
//! assert!(limiter.try_acquire(&"alice".to_string()));
//! assert!(limiter.try_acquire(&"alice".to_string()));
//! assert!(!limiter.try_acquire(&"alice".to_string()));
//! assert!(limiter.try_acquire(&"bob".to_string()));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod rate_limit;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState, StateObserver};
pub use config::{CircuitBreakerConfig, RateLimitConfig};
pub use error::{CircuitBreakerError, ResilienceError, ResilienceResult};
pub use rate_limit::{RateLimitDecision, SlidingWindowRateLimiter};
