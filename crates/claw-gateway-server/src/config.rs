//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use claw_gateway::RegistryConfig;
use claw_proto::HelloPolicy;
use claw_resilience::{CircuitBreakerConfig, RateLimitConfig};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TransportConfig;

use crate::error::{ServerError, ServerResult};

/// Default bind address.
pub const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 18789);

/// Default maximum violations before connection termination.
pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default hard cap on a single WebSocket message: 16MB.
pub const DEFAULT_TRANSPORT_LIMIT: usize = 16 * 1024 * 1024;

/// Configuration for WebSocket message handling.
///
/// Frames above the hello policy's `maxPayload` count as violations; frames
/// above `transport_limit` are refused by the WebSocket layer itself and end
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum number of size violations before terminating the connection.
    /// Set to 0 to close immediately on first violation.
    pub max_violations: u32,
    /// Outbound frames queued per connection before senders wait.
    pub outbound_buffer: usize,
    /// Largest message the WebSocket layer will read at all.
    pub transport_limit: usize,
}

impl WebSocketConfig {
    /// Create a new WebSocket configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_violations: DEFAULT_MAX_VIOLATIONS,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            transport_limit: DEFAULT_TRANSPORT_LIMIT,
        }
    }

    /// Set the maximum number of violations before termination.
    #[must_use]
    pub const fn with_max_violations(mut self, max: u32) -> Self {
        self.max_violations = max;
        self
    }

    /// Set the outbound queue depth.
    #[must_use]
    pub const fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }

    /// Set the WebSocket layer's message cap.
    #[must_use]
    pub const fn with_transport_limit(mut self, size: usize) -> Self {
        self.transport_limit = size;
        self
    }

    /// Settings handed to the WebSocket layer on accept.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::default();
        config.max_message_size = Some(self.transport_limit);
        config.max_frame_size = Some(self.transport_limit);
        config
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the gateway server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket server to.
    pub bind_addr: SocketAddr,
    /// Limits announced to every client in `hello-ok`.
    pub policy: HelloPolicy,
    /// Time a new connection has to send its `connect` request.
    pub handshake_timeout: Duration,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Pending-call bound and default invoke timeout.
    pub registry: RegistryConfig,
    /// Per-node circuit breaker settings for operator invokes.
    pub breaker: CircuitBreakerConfig,
    /// Handshakes admitted per peer IP.
    pub connect_rate_limit: RateLimitConfig,
    /// WebSocket configuration for message size limits.
    pub websocket: WebSocketConfig,
}

impl ServerConfig {
    /// Create a new server configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            policy: HelloPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 1000,
            registry: RegistryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            connect_rate_limit: RateLimitConfig::new(30, Duration::from_secs(60)),
            websocket: WebSocketConfig::new(),
        }
    }

    /// Set the hello policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: HelloPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the tick interval announced in the hello policy.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.policy.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the registry configuration.
    #[must_use]
    pub const fn with_registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    /// Set the circuit breaker configuration.
    #[must_use]
    pub const fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Set the per-IP handshake rate limit.
    #[must_use]
    pub const fn with_connect_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.connect_rate_limit = config;
        self
    }

    /// Set the WebSocket configuration.
    #[must_use]
    pub const fn with_websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }

    /// Check the configuration for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] naming the first invalid field.
    pub fn validate(&self) -> ServerResult<()> {
        if self.policy.max_payload == 0 {
            return Err(ServerError::Config("policy.max_payload must be positive".into()));
        }
        if self.policy.max_payload > self.websocket.transport_limit {
            return Err(ServerError::Config(
                "policy.max_payload exceeds the transport limit".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config("handshake_timeout must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        if self.websocket.outbound_buffer == 0 {
            return Err(ServerError::Config("outbound_buffer must be positive".into()));
        }
        self.registry
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        self.breaker
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        self.connect_rate_limit
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDR.into())
    }
}
