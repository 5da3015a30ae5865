//! WebSocket gateway server implementation.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use claw_gateway::{GuardedInvoker, NodeRegistry};
use claw_resilience::SlidingWindowRateLimiter;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::run_connection;

/// State shared by the accept loop and every connection.
#[derive(Debug)]
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) invoker: Arc<GuardedInvoker>,
    pub(crate) limiter: SlidingWindowRateLimiter<IpAddr>,
    pub(crate) connections: AtomicUsize,
    pub(crate) started: Instant,
    pub(crate) shutdown: CancellationToken,
}

/// Holds one connection slot until dropped.
struct ConnectionSlot(Arc<ServerState>);

impl ConnectionSlot {
    fn acquire(state: &Arc<ServerState>) -> Option<Self> {
        let max = state.config.max_connections;
        state
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(state)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Gateway server accepting node and operator connections.
#[derive(Debug)]
pub struct GatewayServer {
    state: Arc<ServerState>,
}

impl GatewayServer {
    /// Create a gateway server with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the configuration is invalid.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let registry = Arc::new(NodeRegistry::new(config.registry));
        let invoker = Arc::new(GuardedInvoker::new(Arc::clone(&registry), config.breaker));
        let limiter = SlidingWindowRateLimiter::new(config.connect_rate_limit);
        Ok(Self {
            state: Arc::new(ServerState {
                config,
                registry,
                invoker,
                limiter,
                connections: AtomicUsize::new(0),
                started: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// The node registry.
    #[must_use]
    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// The circuit-breaker guarded invoker over the registry.
    #[must_use]
    pub fn invoker(&self) -> Arc<GuardedInvoker> {
        Arc::clone(&self.state.invoker)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindFailed`] if the address is unavailable.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        let addr = self.state.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn serve(&self) -> ServerResult<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Serve connections from an already bound listener until
    /// [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Accept failures are logged and skipped; this currently always
    /// returns `Ok` once shut down.
    pub async fn run(&self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener.local_addr().ok();
        info!(addr = ?local_addr, "Gateway server listening");

        let cleanup = tokio::spawn(prune_idle_state(Arc::clone(&self.state)));

        loop {
            tokio::select! {
                biased;
                () = self.state.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => self.handle_connection(stream, peer),
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        cleanup.abort();
        info!("Gateway server shutting down");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = ConnectionSlot::acquire(&self.state) else {
            warn!(
                peer = %peer,
                max = self.state.config.max_connections,
                "Connection rejected: max connections reached"
            );
            return;
        };
        debug!(peer = %peer, "New connection");

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let _slot = slot;
            match run_connection(state, stream, peer).await {
                Ok(()) => debug!(peer = %peer, "Connection closed normally"),
                Err(e) => debug!(peer = %peer, error = %e, "Connection ended with error"),
            }
        });
    }
}

/// Drop idle rate-limit buckets and breakers of departed nodes once per
/// rate-limit window.
async fn prune_idle_state(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(state.config.connect_rate_limit.window);
    interval.tick().await;
    loop {
        interval.tick().await;
        let buckets = state.limiter.cleanup();
        let breakers = state.invoker.prune();
        if buckets > 0 || breakers > 0 {
            debug!(buckets, breakers, "pruned idle state");
        }
    }
}
