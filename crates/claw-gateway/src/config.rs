//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Default bound on in-flight invokes per connection.
pub const DEFAULT_MAX_PENDING_PER_CONNECTION: usize = 1000;

/// Default invoke timeout when the caller gives none.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`NodeRegistry`](crate::NodeRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum in-flight invokes per connection.
    pub max_pending_per_connection: usize,
    /// Timeout applied to invokes that do not specify one.
    pub default_invoke_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_pending_per_connection: DEFAULT_MAX_PENDING_PER_CONNECTION,
            default_invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    /// Set the per-connection pending bound.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending_per_connection = max;
        self
    }

    /// Set the default invoke timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_invoke_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending bound or default timeout is zero.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_pending_per_connection == 0 {
            return Err(GatewayError::Config(
                "max_pending_per_connection must be at least 1".to_string(),
            ));
        }
        if self.default_invoke_timeout.is_zero() {
            return Err(GatewayError::Config(
                "default_invoke_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
