//! Reconnection configuration and exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Attempts before giving up (None = infinite).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (1-based).
    ///
    /// `min(initial * multiplier^(attempt - 1), max)`, never below one
    /// millisecond so a retry always yields to the runtime.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
        )
    }

    /// Whether attempt number `attempt` may be made.
    #[must_use]
    pub const fn should_reconnect(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a multiplier below one or an inverted delay range.
    pub fn validate(&self) -> ClientResult<()> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ClientError::Config(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ClientError::Config(
                "initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Calculate reconnection delay using exponential backoff.
#[must_use]
pub fn calculate_backoff(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let factor = multiplier.powi(exponent);
    let millis = initial_delay.as_millis() as f64 * factor;
    let capped = if millis.is_finite() && millis < max_delay.as_millis() as f64 {
        Duration::from_millis(millis as u64)
    } else {
        max_delay
    };
    capped.max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.max_attempts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test_case(1, 1 ; "first attempt")]
    #[test_case(2, 2 ; "second attempt")]
    #[test_case(3, 4 ; "third attempt")]
    #[test_case(5, 16 ; "fifth attempt")]
    #[test_case(6, 30 ; "capped")]
    #[test_case(1000, 30 ; "far past cap")]
    fn test_delay_for_attempt(attempt: u32, secs: u64) {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn test_delay_with_zero_attempt() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_is_always_positive() {
        let config = ReconnectConfig {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.delay_for_attempt(1) > Duration::ZERO);
    }

    #[test]
    fn test_should_reconnect_infinite() {
        let config = ReconnectConfig::default();
        assert!(config.should_reconnect(1));
        assert!(config.should_reconnect(1000));
    }

    #[test]
    fn test_should_reconnect_limited() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(config.should_reconnect(1));
        assert!(config.should_reconnect(3));
        assert!(!config.should_reconnect(4));
    }

    #[test]
    fn test_calculate_backoff_multipliers() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(60);

        assert_eq!(calculate_backoff(2, initial, max, 1.5), Duration::from_millis(150));
        assert_eq!(calculate_backoff(3, initial, max, 1.5), Duration::from_millis(225));
        assert_eq!(calculate_backoff(3, initial, max, 3.0), Duration::from_millis(900));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let shrinking = ReconnectConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted = ReconnectConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
