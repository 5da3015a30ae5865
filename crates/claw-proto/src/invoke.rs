//! Payloads for gateway-to-node command invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of the `node.invoke.request` event pushed to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequestEvent {
    /// Correlation id of the pending call.
    pub id: String,
    /// Target node id.
    pub node_id: String,
    /// Command to run.
    pub command: String,
    /// JSON-encoded command parameters.
    #[serde(default, rename = "paramsJSON", skip_serializing_if = "Option::is_none")]
    pub params_json: Option<String>,
    /// Time the gateway will wait for the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Caller-supplied deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl InvokeRequestEvent {
    /// Decode the parameters, treating absent or malformed JSON as null.
    #[must_use]
    pub fn params(&self) -> Value {
        self.params_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null)
    }
}

/// Error reported by a node for a failed command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvokeErrorShape {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

/// Parameters of the `node.invoke.result` request sent by a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResultParams {
    /// Correlation id from the invoke request.
    pub id: String,
    /// Reporting node id.
    pub node_id: String,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Result payload pre-encoded as JSON.
    #[serde(default, rename = "payloadJSON", skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvokeErrorShape>,
}

impl InvokeResultParams {
    /// Build a successful result.
    #[must_use]
    pub fn success(id: impl Into<String>, node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            ok: true,
            payload: Some(payload),
            payload_json: None,
            error: None,
        }
    }

    /// Build a failed result.
    #[must_use]
    pub fn failure(
        id: impl Into<String>,
        node_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            ok: false,
            payload: None,
            payload_json: None,
            error: Some(InvokeErrorShape {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// The result payload, falling back to `payloadJSON`.
    ///
    /// Unparseable `payloadJSON` is returned as a JSON string.
    #[must_use]
    pub fn resolved_payload(&self) -> Value {
        if let Some(payload) = &self.payload {
            return payload.clone();
        }
        match self.payload_json.as_deref() {
            Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
            None => Value::Null,
        }
    }
}
