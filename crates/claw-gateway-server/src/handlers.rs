//! Request handlers for gateway server.
//!
//! Each handler takes one decoded request and produces the response frame to
//! send back on the same connection.

use std::time::Duration;

use claw_gateway::{GuardedInvoker, InvokeRequest, NodeInfo, NodeRegistry};
use claw_proto::{
    ErrorShape, InvokeResultParams, RequestFrame, ResponseFrame, EVENT_INVOKE_REQUEST, EVENT_TICK,
    METHOD_INVOKE_RESULT,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Operator method that runs a command on a node.
pub const METHOD_NODE_INVOKE: &str = "node.invoke";

/// Operator method that lists connected nodes.
pub const METHOD_NODE_LIST: &str = "node.list";

/// Malformed or out-of-place request.
pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Method the gateway does not serve.
pub const ERROR_UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";

/// Peer exceeded the handshake rate limit.
pub const ERROR_RATE_LIMITED: &str = "RATE_LIMITED";

/// No protocol version acceptable to both sides.
pub const ERROR_PROTOCOL_MISMATCH: &str = "PROTOCOL_MISMATCH";

/// Parameters of a `node.invoke` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeParams {
    /// Target node id.
    pub node_id: String,
    /// Command to run.
    pub command: String,
    /// Command parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// How long to wait for the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Deduplication key passed through to the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl NodeInvokeParams {
    /// Convert to a registry request.
    #[must_use]
    pub fn into_request(self) -> InvokeRequest {
        InvokeRequest {
            node_id: self.node_id,
            command: self.command,
            params: self.params,
            timeout: self.timeout_ms.map(Duration::from_millis),
            idempotency_key: self.idempotency_key,
        }
    }
}

/// Methods advertised in `hello-ok`.
#[must_use]
pub fn supported_methods() -> Vec<String> {
    [METHOD_INVOKE_RESULT, METHOD_NODE_INVOKE, METHOD_NODE_LIST]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Events advertised in `hello-ok`.
#[must_use]
pub fn supported_events() -> Vec<String> {
    [EVENT_TICK, EVENT_INVOKE_REQUEST]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Public view of a connected node.
#[must_use]
pub fn node_summary(info: &NodeInfo) -> Value {
    json!({
        "nodeId": info.node_id,
        "connId": info.conn_id,
        "displayName": info.display_name,
        "platform": info.platform,
        "version": info.version,
        "caps": info.caps,
        "commands": info.commands,
        "remoteIp": info.remote_ip.map(|ip| ip.to_string()),
        "connectedAtMs": info.connected_at.timestamp_millis(),
    })
}

fn invalid_request(id: String, message: impl Into<String>) -> ResponseFrame {
    ResponseFrame::error(id, ErrorShape::new(ERROR_INVALID_REQUEST, message))
}

/// Handle `node.invoke.result` from a node connection.
///
/// Results that match no pending call are acknowledged and dropped.
pub fn handle_invoke_result(
    registry: &NodeRegistry,
    conn_id: &str,
    request: &RequestFrame,
) -> ResponseFrame {
    let params: InvokeResultParams = match request.parse_params() {
        Ok(params) => params,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "malformed invoke result");
            return invalid_request(request.id.clone(), e.to_string());
        }
    };
    let handled = registry.handle_invoke_result(conn_id, params);
    ResponseFrame::ok(request.id.clone(), Some(json!({ "ok": true, "ignored": !handled })))
}

/// Handle `node.list`.
pub fn handle_node_list(registry: &NodeRegistry, request: &RequestFrame) -> ResponseFrame {
    let nodes: Vec<Value> = registry.list_connected().iter().map(node_summary).collect();
    debug!(count = nodes.len(), "listing nodes");
    ResponseFrame::ok(request.id.clone(), Some(json!({ "nodes": nodes })))
}

/// Handle `node.invoke`.
///
/// Registry outcomes map onto the response error with the same code.
pub async fn handle_node_invoke(invoker: &GuardedInvoker, request: RequestFrame) -> ResponseFrame {
    let params: NodeInvokeParams = match request.parse_params() {
        Ok(params) => params,
        Err(e) => return invalid_request(request.id, e.to_string()),
    };
    match invoker.invoke(params.into_request()).await {
        Ok(payload) => ResponseFrame::ok(request.id, Some(payload)),
        Err(err) => ResponseFrame::error(request.id, err.to_error_shape()),
    }
}

/// Reply to a method the gateway does not serve.
#[must_use]
pub fn unknown_method(request: &RequestFrame) -> ResponseFrame {
    ResponseFrame::error(
        request.id.clone(),
        ErrorShape::new(ERROR_UNKNOWN_METHOD, format!("unknown method: {}", request.method)),
    )
}
