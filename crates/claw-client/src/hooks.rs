//! Optional callbacks for lifecycle and request metrics.
//!
//! Every method has a no-op default, so implementors override only what
//! they observe.

use std::time::Duration;

use claw_proto::{EventFrame, HelloOk};

use crate::error::ClientError;

/// Connection lifecycle callbacks.
pub trait ClientHandler: Send + Sync {
    /// The gateway accepted the handshake.
    fn on_hello(&self, _hello: &HelloOk) {}

    /// An event arrived from the gateway.
    fn on_event(&self, _event: &EventFrame) {}

    /// An established connection ended.
    fn on_close(&self, _reason: &str) {}

    /// A connection attempt failed before the handshake completed.
    fn on_connect_error(&self, _error: &ClientError) {}
}

/// Request and reconnect metrics.
pub trait ClientMetrics: Send + Sync {
    /// A request was sent.
    fn on_request_start(&self, _method: &str) {}

    /// A request got a successful response.
    fn on_request_success(&self, _method: &str, _duration: Duration) {}

    /// A request failed: error response, timeout, or client stop.
    fn on_request_error(&self, _method: &str, _duration: Duration, _error: &ClientError) {}

    /// A reconnect is scheduled.
    fn on_reconnect(&self, _attempt: u32, _delay: Duration) {}
}

/// Handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}

/// Metrics sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ClientMetrics for NoopMetrics {}
