//! Handshake payloads: the `connect` request and the `hello-ok` reply.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, ProtoResult};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version still accepted.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Newest protocol version accepted.
pub const MAX_PROTOCOL_VERSION: u32 = PROTOCOL_VERSION;

/// Pick the highest version both sides support.
///
/// # Errors
///
/// Returns [`ProtoError::ProtocolMismatch`] when the ranges do not overlap.
pub fn negotiate_protocol(
    client_min: u32,
    client_max: u32,
    server_min: u32,
    server_max: u32,
) -> ProtoResult<u32> {
    let chosen = client_max.min(server_max);
    if chosen < client_min.max(server_min) {
        return Err(ProtoError::ProtocolMismatch {
            client_min,
            client_max,
            server_min,
            server_max,
        });
    }
    Ok(chosen)
}

/// Identity of the connecting client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Stable client id (for nodes, the node id).
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Client software version.
    pub version: String,
    /// Platform string, e.g. `linux x86_64`.
    pub platform: String,
    /// Client mode, e.g. `node` or `operator`.
    pub mode: String,
    /// Per-process instance id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Shared-secret authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthParams {
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Pre-computed device identity proof.
///
/// The gateway core carries this through unchanged; verifying it is the
/// job of the authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    /// Device id derived from the public key.
    pub id: String,
    /// Encoded public key.
    pub public_key: String,
    /// Signature over the connect payload.
    pub signature: String,
    /// Signing time in milliseconds since the epoch.
    pub signed_at: u64,
    /// Challenge nonce, when the gateway issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol version the client accepts.
    pub min_protocol: u32,
    /// Highest protocol version the client accepts.
    pub max_protocol: u32,
    /// Client identity.
    pub client: ClientInfo,
    /// Capability tags.
    #[serde(default)]
    pub caps: Vec<String>,
    /// Commands the client can execute when invoked.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Connection role, e.g. `node` or `operator`.
    #[serde(default = "default_role")]
    pub role: String,
    /// Authorization scopes requested.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Shared-secret auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    /// Device identity proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
}

fn default_role() -> String {
    "operator".to_string()
}

impl ConnectParams {
    /// Check the parameters are internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an inverted version range or empty id.
    pub fn validate(&self) -> ProtoResult<()> {
        if self.min_protocol > self.max_protocol {
            return Err(ProtoError::Validation(format!(
                "minProtocol {} exceeds maxProtocol {}",
                self.min_protocol, self.max_protocol
            )));
        }
        if self.client.id.trim().is_empty() {
            return Err(ProtoError::Validation("client id cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Server identity reported in the hello.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Gateway software version.
    pub version: String,
    /// Connection id assigned to this session.
    pub conn_id: String,
}

/// Methods and events the gateway supports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Features {
    /// Supported request methods.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Events the gateway may emit.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Per-domain version counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateVersion {
    /// Presence list version.
    pub presence: u64,
    /// Health map version.
    pub health: u64,
}

/// Initial state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Presence entries of connected clients.
    #[serde(default)]
    pub presence: Vec<Value>,
    /// Health map keyed by component.
    #[serde(default)]
    pub health: BTreeMap<String, Value>,
    /// Version counters.
    #[serde(default)]
    pub state_version: StateVersion,
    /// Gateway uptime in milliseconds.
    #[serde(default)]
    pub uptime_ms: u64,
}

/// Limits the server declares for this connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    /// Largest frame the server accepts, in bytes.
    pub max_payload: usize,
    /// Largest amount of unsent data the server buffers, in bytes.
    pub max_buffered_bytes: usize,
    /// Keepalive interval in milliseconds.
    pub tick_interval_ms: u64,
}

impl HelloPolicy {
    /// Keepalive interval as a duration.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for HelloPolicy {
    fn default() -> Self {
        Self {
            max_payload: 1024 * 1024,
            max_buffered_bytes: 3 * 512 * 1024,
            tick_interval_ms: 30_000,
        }
    }
}

/// Payload of the handshake-accepted response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename = "hello-ok", rename_all = "camelCase")]
pub struct HelloOk {
    /// Negotiated protocol version.
    pub protocol: u32,
    /// Server identity.
    pub server: ServerInfo,
    /// Supported features.
    #[serde(default)]
    pub features: Features,
    /// Initial state snapshot.
    #[serde(default)]
    pub snapshot: Snapshot,
    /// Declared limits.
    pub policy: HelloPolicy,
}

impl HelloOk {
    /// Decode a hello from a response payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a `hello-ok` object.
    pub fn from_payload(payload: Value) -> ProtoResult<Self> {
        serde_json::from_value(payload).map_err(|e| ProtoError::Decoding(format!("hello-ok: {e}")))
    }

    /// Encode the hello as a response payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> ProtoResult<Value> {
        serde_json::to_value(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }
}
