//! Circuit-breaker guarded invocation.

use std::collections::HashMap;
use std::sync::Arc;

use claw_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{InvokeError, InvokeResult};
use crate::registry::{InvokeRequest, NodeRegistry};

/// Invokes through one circuit breaker per node.
///
/// Timeouts and disconnects count against the node's breaker. Other
/// outcomes, including errors the node itself reports, pass through without
/// affecting it. While a node's breaker is open, invokes fail with
/// `CIRCUIT_OPEN` without reaching the registry.
#[derive(Debug)]
pub struct GuardedInvoker {
    registry: Arc<NodeRegistry>,
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl GuardedInvoker {
    /// Create an invoker over `registry`.
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, config: CircuitBreakerConfig) -> Self {
        Self {
            registry,
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn breaker(&self, node_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(node_id) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(node_id.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.config).with_name(node_id))
        }))
    }

    /// Breaker state for a node, if it has one.
    pub fn state(&self, node_id: &str) -> Option<CircuitState> {
        self.breakers.read().get(node_id).map(|b| b.state())
    }

    /// Number of nodes holding a breaker.
    pub fn breaker_count(&self) -> usize {
        self.breakers.read().len()
    }

    /// Drop breakers of nodes that are no longer connected, keeping those
    /// still rejecting calls. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut breakers = self.breakers.write();
        let before = breakers.len();
        breakers.retain(|node_id, breaker| {
            self.registry.get(node_id).is_some() || !breaker.is_call_permitted()
        });
        before - breakers.len()
    }

    /// Force a node's breaker closed.
    pub fn reset(&self, node_id: &str) {
        if let Some(breaker) = self.breakers.read().get(node_id) {
            breaker.reset();
        }
    }

    /// Invoke through the node's breaker.
    pub async fn invoke(&self, request: InvokeRequest) -> InvokeResult {
        let node_id = request.node_id.clone();
        // Unknown nodes never get a breaker.
        if self.registry.get(&node_id).is_none() {
            return Err(InvokeError::node_not_found(&node_id));
        }
        let breaker = self.breaker(&node_id);
        let registry = Arc::clone(&self.registry);

        // Outer `Err` is what the breaker counts; inner errors pass through.
        let outcome = breaker
            .call(|| async move {
                match registry.invoke(request).await {
                    Err(err) if err.code.is_node_failure() => Err(err),
                    other => Ok(other),
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitBreakerError::Inner(err)) => Err(err),
            Err(CircuitBreakerError::Open { retry_after, .. }) => {
                debug!(node_id = %node_id, "invoke short-circuited");
                Err(InvokeError::circuit_open(&node_id, retry_after))
            }
        }
    }
}
