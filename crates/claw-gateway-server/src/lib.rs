//! # claw-gateway-server
//!
//! WebSocket gateway server for Clawbernetes node fleet communication.
//!
//! Nodes and operators connect over WebSocket and speak the `claw-proto`
//! frame protocol. Node connections are admitted into a
//! [`NodeRegistry`](claw_gateway::NodeRegistry); operators invoke commands
//! on them through per-node circuit breakers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────────────┐
//! │   clawnode   │◄──────────────────►│    GatewayServer     │
//! │ (role=node)  │                    │                      │
//! └──────────────┘                    │  ┌────────────────┐  │
//!                                     │  │  NodeRegistry  │  │
//! ┌──────────────┐                    │  └────────────────┘  │
//! │   operator   │◄──────────────────►│  ┌────────────────┐  │
//! │              │                    │  │ GuardedInvoker │  │
//! └──────────────┘                    │  └────────────────┘  │
//!                                     └──────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use claw_gateway_server::{GatewayServer, ServerConfig};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: SocketAddr = "0.0.0.0:18789".parse()?;
//!     let server = GatewayServer::new(ServerConfig::new(addr).with_max_connections(1000))?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Connection Lifecycle
//!
//! 1. The first frame must be a `connect` request. Handshakes are rate
//!    limited per peer IP; over the limit the peer gets `RATE_LIMITED`.
//! 2. The server negotiates the protocol and replies `hello-ok` with a fresh
//!    connection id and its [`HelloPolicy`](claw_proto::HelloPolicy).
//! 3. Connections with role `node` join the registry until they close.
//!
//! Requests served after the handshake:
//!
//! - `node.invoke.result`: a node reporting a command outcome
//! - `node.invoke`: run a command on a node
//! - `node.list`: connected nodes
//!
//! The server sends `tick` events at the policy interval.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod session;

pub use config::{
    ServerConfig, WebSocketConfig, DEFAULT_BIND_ADDR, DEFAULT_MAX_VIOLATIONS,
    DEFAULT_OUTBOUND_BUFFER, DEFAULT_TRANSPORT_LIMIT,
};
pub use error::{ServerError, ServerResult};
pub use handlers::{
    handle_invoke_result, handle_node_invoke, handle_node_list, NodeInvokeParams,
    ERROR_INVALID_REQUEST, ERROR_PROTOCOL_MISMATCH, ERROR_RATE_LIMITED, ERROR_UNKNOWN_METHOD,
    METHOD_NODE_INVOKE, METHOD_NODE_LIST,
};
pub use server::GatewayServer;
pub use session::{decode_ws_message, frame_to_ws, ws_message_size, ViolationTracker, ROLE_NODE};
