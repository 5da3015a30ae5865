//! Client options.

use std::time::Duration;

use claw_proto::{
    AuthParams, ClientInfo, ConnectParams, DeviceProof, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};

use crate::error::{ClientError, ClientResult};
use crate::reconnect::ReconnectConfig;

/// Default time allowed for transport open plus `hello-ok`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Client identity sent in `connect`.
    pub client: ClientInfo,
    /// Lowest acceptable protocol version.
    pub min_protocol: u32,
    /// Highest acceptable protocol version.
    pub max_protocol: u32,
    /// Capability tags.
    pub caps: Vec<String>,
    /// Commands this client can execute when invoked.
    pub commands: Vec<String>,
    /// Connection role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Shared-secret token.
    pub auth_token: Option<String>,
    /// Pre-computed device proof.
    pub device: Option<DeviceProof>,
    /// Time allowed for transport open plus `hello-ok`.
    pub handshake_timeout: Duration,
    /// Default request timeout.
    pub request_timeout: Duration,
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
}

impl ClientOptions {
    /// Options for an operator client with default timeouts.
    #[must_use]
    pub fn new(client: ClientInfo) -> Self {
        Self {
            client,
            min_protocol: MIN_PROTOCOL_VERSION,
            max_protocol: MAX_PROTOCOL_VERSION,
            caps: Vec::new(),
            commands: Vec::new(),
            role: "operator".to_string(),
            scopes: Vec::new(),
            auth_token: None,
            device: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Set the role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set the capability tags.
    #[must_use]
    pub fn with_caps(mut self, caps: Vec<String>) -> Self {
        self.caps = caps;
        self
    }

    /// Set the commands this client executes.
    #[must_use]
    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    /// Set the scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set the auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the device proof.
    #[must_use]
    pub fn with_device(mut self, device: DeviceProof) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Build the `connect` request parameters.
    #[must_use]
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            caps: self.caps.clone(),
            commands: self.commands.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth: self.auth_token.as_ref().map(|token| AuthParams {
                token: Some(token.clone()),
            }),
            device: self.device.clone(),
        }
    }

    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid identity, version range, timeout or
    /// backoff policy.
    pub fn validate(&self) -> ClientResult<()> {
        self.connect_params().validate()?;
        if self.handshake_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(ClientError::Config("timeouts must be non-zero".to_string()));
        }
        self.reconnect.validate()
    }
}
