//! # claw-gateway
//!
//! Node registry for the Clawbernetes gateway.
//!
//! Nodes hold one persistent connection each. The registry owns those
//! sessions and turns control-plane calls into correlated RPCs:
//!
//! - [`NodeRegistry`] - Tracks connected nodes and dispatches [`InvokeRequest`]s
//! - [`NodeSession`] - One node's connection and its bounded set of pending calls
//! - [`GuardedInvoker`] - Per-node circuit breakers in front of the registry
//!
//! Every pending call resolves exactly once: by the node's reply, by its
//! timeout, or with `NODE_DISCONNECTED` when the node goes away.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod guarded;
pub mod registry;
pub mod session;

pub use config::RegistryConfig;
pub use error::{GatewayError, GatewayResult, InvokeError, InvokeErrorCode, InvokeResult};
pub use guarded::GuardedInvoker;
pub use registry::{InvokeRequest, NodeRegistry};
pub use session::{NodeInfo, NodeSession};
