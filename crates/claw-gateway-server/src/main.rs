//! Clawbernetes Gateway Server binary.
//!
//! The gateway is the control plane for a Clawbernetes cluster.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use claw_gateway::RegistryConfig;
use claw_gateway_server::{GatewayServer, ServerConfig, WebSocketConfig};
use claw_resilience::{CircuitBreakerConfig, RateLimitConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-gateway")]
#[command(about = "Clawbernetes Gateway Server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CLAW_GATEWAY_BIND", default_value = "0.0.0.0:18789")]
    bind: SocketAddr,

    /// Maximum concurrent connections
    #[arg(long, env = "CLAW_GATEWAY_MAX_CONNECTIONS", default_value_t = 1000)]
    max_connections: usize,

    /// Largest frame accepted from clients, in bytes
    #[arg(long, env = "CLAW_GATEWAY_MAX_PAYLOAD", default_value_t = 1024 * 1024)]
    max_payload: usize,

    /// Tick interval announced to clients, in milliseconds
    #[arg(long, env = "CLAW_GATEWAY_TICK_MS", default_value_t = 30_000)]
    tick_ms: u64,

    /// Seconds a new connection has to send `connect`
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Pending invokes allowed per node connection
    #[arg(long, default_value_t = 1000)]
    max_pending: usize,

    /// Default invoke timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    invoke_timeout_ms: u64,

    /// Consecutive node failures that open its circuit breaker
    #[arg(long, default_value_t = 5)]
    breaker_threshold: u32,

    /// Handshakes allowed per peer IP per window
    #[arg(long, env = "CLAW_GATEWAY_CONNECT_LIMIT", default_value_t = 30)]
    connect_limit: u32,

    /// Handshake rate-limit window in seconds
    #[arg(long, default_value_t = 60)]
    connect_window_secs: u64,

    /// Oversized frames tolerated before a connection is closed
    #[arg(long, default_value_t = 3)]
    max_violations: u32,

    /// Emit logs as JSON
    #[arg(long, env = "CLAW_GATEWAY_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.bind)
            .with_max_connections(self.max_connections)
            .with_tick_interval(Duration::from_millis(self.tick_ms))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_registry_config(
                RegistryConfig::default()
                    .with_max_pending(self.max_pending)
                    .with_default_timeout(Duration::from_millis(self.invoke_timeout_ms)),
            )
            .with_breaker_config(
                CircuitBreakerConfig::default().with_failure_threshold(self.breaker_threshold),
            )
            .with_connect_rate_limit(RateLimitConfig::new(
                self.connect_limit,
                Duration::from_secs(self.connect_window_secs),
            ))
            .with_websocket_config(WebSocketConfig::new().with_max_violations(self.max_violations));
        config.policy.max_payload = self.max_payload;
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.server_config();
    info!("Starting Clawbernetes Gateway on {}", config.bind_addr);
    info!("  Nodes connect via:  CLAWNODE_GATEWAY=ws://{}/", config.bind_addr);

    let server = std::sync::Arc::new(GatewayServer::new(config)?);
    let listener = server.bind().await?;

    let signal_server = std::sync::Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_server.shutdown();
        }
    });

    if let Err(e) = server.run(listener).await {
        error!("Gateway error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
