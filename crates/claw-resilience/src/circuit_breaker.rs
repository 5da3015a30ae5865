//! Three-state circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ reset_timeout elapsed,
//!     │ probe succeeds                 │ next call
//!     │                                ▼
//!     └──────────────────────────── HALF_OPEN
//!                                      │ probe fails
//!                                      └──────▶ OPEN (timer re-armed)
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitBreakerError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// A bounded number of probe calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with `(from, to)` on every state transition.
pub type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Total failed calls.
    pub failures: u64,
    /// Total successful calls.
    pub successes: u64,
    /// When the most recent failure happened.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Failures since the last success or close.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u64,
    successes: u64,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl Inner {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            last_failure_time: None,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    /// Move to `to`, returning the transition if the state changed.
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        match to {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.half_open_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = 0;
            }
        }
        Some((from, to))
    }

    fn retry_after(&self, reset_timeout: Duration) -> Duration {
        self.opened_at
            .map_or(Duration::ZERO, |at| reset_timeout.saturating_sub(at.elapsed()))
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Guards a probe slot so a cancelled probe does not hold it forever.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl ProbeSlot<'_> {
    fn disarm(mut self) -> Admission {
        self.armed = false;
        self.admission
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed && self.admission == Admission::Probe {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

/// Failure-isolation wrapper around fallible async calls.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker.
    ///
    /// Zero thresholds are raised to one.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            half_open_max_attempts: config.half_open_max_attempts.max(1),
            ..config
        };
        Self {
            name: "default".to_string(),
            config,
            inner: Mutex::new(Inner::new()),
            observer: None,
        }
    }

    /// Name used in log lines.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a state-change observer.
    #[must_use]
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An expired OPEN breaker reports OPEN until the next call.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be let through, without changing state.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.retry_after(self.config.reset_timeout).is_zero(),
            CircuitState::HalfOpen => {
                inner.half_open_in_flight < self.config.half_open_max_attempts
            }
        }
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_time: inner.last_failure_time,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Force the breaker closed and clear consecutive failures and probes.
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.transition(CircuitState::Closed);
            inner.consecutive_failures = 0;
            inner.half_open_in_flight = 0;
            changed
        };
        if changed.is_some() {
            info!(breaker = %self.name, "circuit breaker reset");
        } else {
            debug!(breaker = %self.name, "circuit breaker reset while closed");
        }
        self.notify(changed);
    }

    /// Run `f` through the breaker.
    ///
    /// When the breaker rejects the call, `f` is never invoked.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.acquire()?;
        let slot = ProbeSlot {
            breaker: self,
            admission,
            armed: true,
        };

        let result = f().await;
        let admission = slot.disarm();

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn acquire<E>(&self) -> Result<Admission, CircuitBreakerError<E>> {
        let mut changed = None;
        let result = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::Open => {
                    let retry_after = inner.retry_after(self.config.reset_timeout);
                    if retry_after.is_zero() {
                        changed = inner.transition(CircuitState::HalfOpen);
                        inner.half_open_in_flight += 1;
                        Ok(Admission::Probe)
                    } else {
                        Err(CircuitBreakerError::Open {
                            state: CircuitState::Open,
                            retry_after,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_attempts {
                        inner.half_open_in_flight += 1;
                        Ok(Admission::Probe)
                    } else {
                        Err(CircuitBreakerError::Open {
                            state: CircuitState::HalfOpen,
                            retry_after: inner.retry_after(self.config.reset_timeout),
                        })
                    }
                }
            }
        };

        if let Err(CircuitBreakerError::Open { state, retry_after }) = &result {
            debug!(
                breaker = %self.name,
                state = %state,
                retry_after_ms = retry_after.as_millis() as u64,
                "call rejected by circuit breaker"
            );
        }
        self.notify(changed);
        result
    }

    fn on_success(&self, admission: Admission) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.successes += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if admission == Admission::Probe => {
                    inner.transition(CircuitState::Closed)
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(changed);
    }

    fn on_failure(&self, admission: Admission) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.failures += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure_time = Some(Utc::now());
            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen if admission == Admission::Probe => {
                    inner.transition(CircuitState::Open)
                }
                _ => None,
            }
        };
        self.notify(changed);
    }

    fn notify(&self, changed: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = changed else {
            return;
        };
        if to == CircuitState::Open {
            warn!(breaker = %self.name, from = %from, to = %to, "circuit breaker opened");
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "circuit breaker state changed");
        }
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
