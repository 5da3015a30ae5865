//! Per-connection node session and its pending-call set.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use claw_proto::{ConnectParams, Frame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::InvokeResult;

/// Identity and capabilities a node declared at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Connection id, unique per session.
    pub conn_id: String,
    /// Node id, stable across reconnects.
    pub node_id: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Platform string (e.g. `linux`).
    pub platform: String,
    /// Node software version.
    pub version: String,
    /// Negotiated protocol version.
    pub protocol: u32,
    /// Declared capabilities.
    pub caps: Vec<String>,
    /// Commands the node accepts.
    pub commands: Vec<String>,
    /// Connection role.
    pub role: String,
    /// Authorization scopes.
    pub scopes: Vec<String>,
    /// Peer address.
    pub remote_ip: Option<IpAddr>,
    /// When the session was established.
    pub connected_at: DateTime<Utc>,
}

impl NodeInfo {
    /// Create node info with empty capabilities.
    #[must_use]
    pub fn new(conn_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            node_id: node_id.into(),
            display_name: None,
            platform: String::new(),
            version: String::new(),
            protocol: claw_proto::PROTOCOL_VERSION,
            caps: Vec::new(),
            commands: Vec::new(),
            role: "node".to_string(),
            scopes: Vec::new(),
            remote_ip: None,
            connected_at: Utc::now(),
        }
    }

    /// Build node info from a validated `connect` request.
    ///
    /// The node id is the device id when a device proof is present, else the
    /// client id.
    #[must_use]
    pub fn from_connect(
        conn_id: impl Into<String>,
        params: &ConnectParams,
        protocol: u32,
        remote_ip: Option<IpAddr>,
    ) -> Self {
        let node_id = params
            .device
            .as_ref()
            .map_or_else(|| params.client.id.clone(), |device| device.id.clone());
        Self {
            conn_id: conn_id.into(),
            node_id,
            display_name: params.client.display_name.clone(),
            platform: params.client.platform.clone(),
            version: params.client.version.clone(),
            protocol,
            caps: params.caps.clone(),
            commands: params.commands.clone(),
            role: params.role.clone(),
            scopes: params.scopes.clone(),
            remote_ip,
            connected_at: Utc::now(),
        }
    }

    /// Set the declared commands.
    #[must_use]
    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    /// Set the declared capabilities.
    #[must_use]
    pub fn with_caps(mut self, caps: Vec<String>) -> Self {
        self.caps = caps;
        self
    }
}

/// One in-flight invoke.
#[derive(Debug)]
pub(crate) struct PendingInvoke {
    pub(crate) command: String,
    pub(crate) submitted_at: Instant,
    pub(crate) timer: AbortHandle,
    reply: oneshot::Sender<InvokeResult>,
}

impl PendingInvoke {
    pub(crate) fn new(
        command: String,
        timer: AbortHandle,
        reply: oneshot::Sender<InvokeResult>,
    ) -> Self {
        Self {
            command,
            submitted_at: Instant::now(),
            timer,
            reply,
        }
    }

    /// Deliver the outcome. The caller may have gone away, which is fine.
    pub(crate) fn resolve(self, result: InvokeResult) {
        let _ = self.reply.send(result);
    }

    /// Cancel the timer and deliver the outcome.
    pub(crate) fn cancel_and_resolve(self, result: InvokeResult) {
        self.timer.abort();
        self.resolve(result);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingSet {
    pub(crate) calls: HashMap<String, PendingInvoke>,
    pub(crate) closed: bool,
}

/// A connected node.
///
/// Owned by the [`NodeRegistry`](crate::NodeRegistry) from handshake until
/// unregistration. All resolution paths claim a pending call by removing it
/// under the `pending` lock; whoever removes it resolves it.
#[derive(Debug)]
pub struct NodeSession {
    info: NodeInfo,
    sender: mpsc::Sender<Frame>,
    pub(crate) pending: Mutex<PendingSet>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl NodeSession {
    pub(crate) fn new(info: NodeInfo, sender: mpsc::Sender<Frame>) -> Self {
        let now = info.connected_at;
        Self {
            info,
            sender,
            pending: Mutex::new(PendingSet::default()),
            last_seen: Mutex::new(now),
        }
    }

    /// Handshake information.
    #[must_use]
    pub const fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Connection id.
    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.info.conn_id
    }

    /// Node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    /// Number of in-flight invokes.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().calls.len()
    }

    /// Whether the session has been unregistered.
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    /// Last inbound activity.
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// Queue a frame on the connection. Returns `false` if the connection's
    /// writer has gone away.
    pub async fn send(&self, frame: Frame) -> bool {
        self.sender.send(frame).await.is_ok()
    }

    /// Claim a pending call, if nobody else has.
    pub(crate) fn take(&self, id: &str) -> Option<PendingInvoke> {
        self.pending.lock().calls.remove(id)
    }

    /// Mark the session closed and claim every pending call.
    pub(crate) fn close(&self) -> Vec<PendingInvoke> {
        let mut pending = self.pending.lock();
        pending.closed = true;
        pending.calls.drain().map(|(_, call)| call).collect()
    }
}
