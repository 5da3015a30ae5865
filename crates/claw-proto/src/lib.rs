//! # claw-proto
//!
//! Frame definitions for the node-gateway RPC protocol.
//!
//! Every message on a connection is a JSON object tagged by `type`:
//!
//! - `req` - a correlated request ([`RequestFrame`])
//! - `res` - the reply to a request ([`ResponseFrame`])
//! - `event` - an uncorrelated push ([`EventFrame`])
//!
//! The handshake is a `connect` request answered by a `hello-ok` response,
//! see [`handshake`]. Gateway-to-node command invocation travels as a
//! `node.invoke.request` event and comes back as a `node.invoke.result`
//! request, see [`invoke`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod frames;
pub mod handshake;
pub mod invoke;

pub use error::{ProtoError, ProtoResult};
pub use frames::{new_request_id, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};
pub use handshake::{
    negotiate_protocol, AuthParams, ClientInfo, ConnectParams, DeviceProof, Features, HelloOk,
    HelloPolicy, ServerInfo, Snapshot, StateVersion, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use invoke::{InvokeErrorShape, InvokeRequestEvent, InvokeResultParams};

/// Method name of the handshake request.
pub const METHOD_CONNECT: &str = "connect";

/// Method name a node uses to report the outcome of an invoked command.
pub const METHOD_INVOKE_RESULT: &str = "node.invoke.result";

/// Event name the gateway uses to push a command to a node.
pub const EVENT_INVOKE_REQUEST: &str = "node.invoke.request";

/// Event a client sends to keep its connection alive.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Event the gateway sends at the policy tick interval.
pub const EVENT_TICK: &str = "tick";

/// Event the gateway may send before the hello, carrying a signing nonce.
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
