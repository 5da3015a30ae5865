//! # claw-client
//!
//! Reconnecting RPC client for the gateway protocol.
//!
//! [`RpcClient`] owns one logical connection to a gateway. It performs the
//! `connect` / `hello-ok` handshake, correlates requests with responses,
//! sends heartbeats at the interval the gateway asks for, and reconnects
//! with bounded exponential backoff when the transport drops.
//!
//! The transport is pluggable through [`Connector`]; [`WsConnector`] speaks
//! JSON frames over a WebSocket.
//!
//! # Example
//!
//! ```rust,no_run
//! use claw_client::{ClientOptions, ConnectionState, RpcClient, WsConnector};
//! use claw_proto::ClientInfo;
//!
//! # async fn run() -> Result<(), claw_client::ClientError> {
//! let options = ClientOptions::new(ClientInfo {
//!     id: "ops-console".into(),
//!     display_name: None,
//!     version: "0.1.0".into(),
//!     platform: "linux".into(),
//!     mode: "operator".into(),
//!     instance_id: None,
//! });
//! let client = RpcClient::builder(options, WsConnector::new("ws://127.0.0.1:18789")).build();
//! client.start();
//! client.wait_for_state(ConnectionState::Connected).await;
//!
//! let nodes = client.request("node.list", None).await?;
//! println!("{nodes}");
//! client.stop();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod heartbeat;
pub mod hooks;
pub mod options;
pub mod reconnect;
pub mod state;
pub mod transport;

pub use client::{RpcClient, RpcClientBuilder};
pub use error::{ClientError, ClientResult};
pub use hooks::{ClientHandler, ClientMetrics, NoopHandler, NoopMetrics};
pub use options::ClientOptions;
pub use reconnect::ReconnectConfig;
pub use state::ConnectionState;
pub use transport::{Connector, FrameChannel, WsConnector};
