//! Reconnecting RPC client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use claw_proto::{
    EventFrame, Frame, HelloOk, HelloPolicy, ProtoError, RequestFrame, ResponseFrame,
    EVENT_CONNECT_CHALLENGE, EVENT_HEARTBEAT, EVENT_TICK, METHOD_CONNECT,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ClientError, ClientResult};
use crate::heartbeat::{Keepalive, KeepaliveEvent};
use crate::hooks::{ClientHandler, ClientMetrics, NoopHandler, NoopMetrics};
use crate::options::ClientOptions;
use crate::state::ConnectionState;
use crate::transport::{Connector, FrameChannel};

const EVENT_BUFFER: usize = 256;

/// One in-flight request.
struct PendingRequest {
    method: String,
    started: Instant,
    reply: oneshot::Sender<ClientResult<Value>>,
}

struct Shared {
    options: ClientOptions,
    connector: Box<dyn Connector>,
    handler: Arc<dyn ClientHandler>,
    metrics: Arc<dyn ClientMetrics>,
    state: watch::Sender<ConnectionState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    policy: Mutex<HelloPolicy>,
    hello: Mutex<Option<HelloOk>>,
    events: broadcast::Sender<EventFrame>,
    attempts: AtomicU32,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    options: ClientOptions,
    connector: Box<dyn Connector>,
    handler: Arc<dyn ClientHandler>,
    metrics: Arc<dyn ClientMetrics>,
}

impl RpcClientBuilder {
    /// Set the lifecycle handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ClientHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Set the metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the client. It does not connect until [`RpcClient::start`].
    #[must_use]
    pub fn build(self) -> RpcClient {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        RpcClient {
            shared: Arc::new(Shared {
                options: self.options,
                connector: self.connector,
                handler: self.handler,
                metrics: self.metrics,
                state,
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                policy: Mutex::new(HelloPolicy::default()),
                hello: Mutex::new(None),
                events,
                attempts: AtomicU32::new(0),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

/// Client for one gateway connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("client_id", &self.shared.options.client.id)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Start building a client.
    #[must_use]
    pub fn builder(options: ClientOptions, connector: impl Connector) -> RpcClientBuilder {
        RpcClientBuilder {
            options,
            connector: Box::new(connector),
            handler: Arc::new(NoopHandler),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether a handshake-accepted connection is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the client reaches `target`.
    ///
    /// Returns `false` if the client stops first (unless `target` is
    /// [`ConnectionState::Stopped`]).
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|state| *state == target || state.is_terminal())
            .await
            .is_ok_and(|state| *state == target)
    }

    /// Reconnect attempts since the last accepted handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// The most recent `hello-ok`.
    pub fn hello(&self) -> Option<HelloOk> {
        self.shared.hello.lock().clone()
    }

    /// Policy in force: the gateway's from the latest hello, else defaults.
    pub fn policy(&self) -> HelloPolicy {
        *self.shared.policy.lock()
    }

    /// Subscribe to events pushed by the gateway (ticks excluded).
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventFrame> {
        self.shared.events.subscribe()
    }

    /// Begin connecting in the background. Calling it again has no effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) || self.shared.cancel.is_cancelled() {
            return;
        }
        info!(client_id = %self.shared.options.client.id, "starting gateway client");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.supervise().await });
    }

    /// Stop for good.
    ///
    /// Cancels any pending reconnect, closes the connection, and fails every
    /// pending request with [`ClientError::Stopped`] before returning.
    pub fn stop(&self) {
        self.shared.shutdown("client stopped");
    }

    /// Send a request with the default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        self.request_with_timeout(method, params, self.shared.options.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Requests larger than the gateway's `maxPayload` and requests made
    /// while disconnected fail locally without being sent or counted in
    /// metrics. Once sent, a request resolves by response, timeout, or
    /// [`stop`](Self::stop); a dropped transport alone does not fail it.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ClientResult<Value> {
        let request = RequestFrame::new(method, params);
        let id = request.id.clone();
        let frame: Frame = request.into();

        let size = frame.to_json()?.len();
        let limit = self.shared.policy.lock().max_payload;
        if size > limit {
            warn!(method = %method, size, limit, "request exceeds gateway payload limit");
            return Err(ClientError::PayloadTooLarge { size, limit });
        }

        if self.state().is_terminal() {
            return Err(ClientError::Stopped);
        }
        let Some(tx) = self.shared.outbound.lock().clone() else {
            return Err(ClientError::NotConnected);
        };

        let (reply, mut outcome) = oneshot::channel();
        self.shared.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                started: Instant::now(),
                reply,
            },
        );
        self.shared.metrics.on_request_start(method);
        trace!(method = %method, request_id = %id, "request sent");

        let deadline = Instant::now() + timeout;
        let send = async {
            // A concurrent stop() may have drained before the insert.
            if self.state().is_terminal() {
                self.shared.fail(&id, ClientError::Stopped);
            } else if tx.send(frame).await.is_err() {
                self.shared.fail(&id, ClientError::NotConnected);
            }
        };
        // A stalled writer must not hold the caller past its deadline or a stop().
        tokio::select! {
            biased;
            result = &mut outcome => return result.unwrap_or(Err(ClientError::Stopped)),
            () = tokio::time::sleep_until(deadline) => {}
            () = send => {}
        }

        match tokio::time::timeout_at(deadline, &mut outcome).await {
            Ok(result) => result.unwrap_or(Err(ClientError::Stopped)),
            Err(_) => {
                let timed_out = ClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                };
                if self.shared.fail(&id, timed_out) {
                    debug!(method = %method, request_id = %id, "request timed out");
                }
                // Whoever claimed the entry has resolved it.
                outcome.await.unwrap_or(Err(ClientError::Stopped))
            }
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "connection state changed");
            *state = next;
            true
        });
    }

    /// Claim a pending request and fail it. Returns `false` if it was
    /// already resolved.
    fn fail(&self, id: &str, error: ClientError) -> bool {
        let Some(pending) = self.pending.lock().remove(id) else {
            return false;
        };
        self.metrics
            .on_request_error(&pending.method, pending.started.elapsed(), &error);
        let _ = pending.reply.send(Err(error));
        true
    }

    fn shutdown(&self, reason: &str) {
        self.cancel.cancel();
        self.outbound.lock().take();
        self.state.send_replace(ConnectionState::Stopped);

        let drained: Vec<String> = self.pending.lock().keys().cloned().collect();
        let failed = drained
            .iter()
            .filter(|id| self.fail(id, ClientError::Stopped))
            .count();
        info!(
            client_id = %self.options.client.id,
            failed_requests = failed,
            reason = %reason,
            "gateway client stopped"
        );
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                result = tokio::time::timeout(self.options.handshake_timeout, self.connect_once()) => {
                    result.unwrap_or_else(|_| Err(ClientError::Handshake("timed out waiting for hello".to_string())))
                }
            };

            match connected {
                Ok(channel) => {
                    let reason = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        reason = self.run_connection(channel) => reason,
                    };
                    self.outbound.lock().take();
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    warn!(client_id = %self.options.client.id, reason = %reason, "gateway connection lost");
                    self.handler.on_close(&reason);
                }
                Err(e) => {
                    warn!(client_id = %self.options.client.id, error = %e, "gateway connect failed");
                    self.handler.on_connect_error(&e);
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if !self.options.reconnect.should_reconnect(attempt) {
                warn!(attempts = attempt - 1, "reconnect attempts exhausted");
                self.shutdown("reconnect attempts exhausted");
                return;
            }
            let delay = self.options.reconnect.delay_for_attempt(attempt);
            self.set_state(ConnectionState::Reconnecting);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.metrics.on_reconnect(attempt, delay);

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open the transport and complete the handshake.
    async fn connect_once(&self) -> ClientResult<FrameChannel> {
        let FrameChannel { tx, mut rx } = self.connector.connect().await?;
        self.set_state(ConnectionState::Handshaking);

        let params = serde_json::to_value(self.options.connect_params())
            .map_err(|e| ProtoError::Encoding(e.to_string()))?;
        let request = RequestFrame::new(METHOD_CONNECT, Some(params));
        let connect_id = request.id.clone();
        tx.send(request.into()).await?;

        let hello = loop {
            let Some(frame) = rx.recv().await else {
                return Err(ClientError::Transport(
                    "connection closed during handshake".to_string(),
                ));
            };
            match frame {
                Frame::Event(event) if event.event == EVENT_CONNECT_CHALLENGE => {
                    debug!("ignoring connect challenge");
                }
                Frame::Response(response) if response.id == connect_id => {
                    let payload = response
                        .into_result()
                        .map_err(|e| ClientError::Handshake(e.to_string()))?;
                    break HelloOk::from_payload(payload)?;
                }
                other => debug!(kind = other.kind(), "ignoring frame before hello"),
            }
        };

        if hello.protocol < self.options.min_protocol || hello.protocol > self.options.max_protocol {
            return Err(ProtoError::ProtocolMismatch {
                client_min: self.options.min_protocol,
                client_max: self.options.max_protocol,
                server_min: hello.protocol,
                server_max: hello.protocol,
            }
            .into());
        }

        *self.policy.lock() = hello.policy;
        *self.outbound.lock() = Some(tx.clone());
        // stop() may have cleared the sender while this handshake was in flight.
        if self.cancel.is_cancelled() {
            self.outbound.lock().take();
            return Err(ClientError::Stopped);
        }
        *self.hello.lock() = Some(hello.clone());
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!(
            client_id = %self.options.client.id,
            conn_id = %hello.server.conn_id,
            protocol = hello.protocol,
            "connected to gateway"
        );
        self.handler.on_hello(&hello);

        Ok(FrameChannel { tx, rx })
    }

    /// Pump one established connection until it ends. Returns the reason.
    async fn run_connection(&self, channel: FrameChannel) -> String {
        let FrameChannel { tx, mut rx } = channel;
        let tick_interval = self.policy.lock().tick_interval();
        let mut keepalive = Keepalive::new(tick_interval);

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        return "connection closed".to_string();
                    };
                    if let Some(keepalive) = keepalive.as_mut() {
                        keepalive.record_inbound();
                    }
                    self.handle_frame(frame);
                }
                event = next_keepalive(keepalive.as_mut()) => match event {
                    KeepaliveEvent::Heartbeat => {
                        let heartbeat = EventFrame::new(EVENT_HEARTBEAT, None);
                        if tx.send(heartbeat.into()).await.is_err() {
                            return "connection closed".to_string();
                        }
                    }
                    KeepaliveEvent::Expired { silent_for } => {
                        return format!("no frames for {}ms", silent_for.as_millis());
                    }
                },
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => self.handle_response(response),
            Frame::Event(event) => {
                if event.event == EVENT_TICK {
                    trace!("tick");
                    return;
                }
                self.handler.on_event(&event);
                let _ = self.events.send(event);
            }
            Frame::Request(request) => {
                debug!(method = %request.method, "ignoring request from gateway");
            }
        }
    }

    fn handle_response(&self, response: ResponseFrame) {
        let Some(pending) = self.pending.lock().remove(&response.id) else {
            debug!(request_id = %response.id, "discarding unmatched response");
            return;
        };
        let elapsed = pending.started.elapsed();
        let result = response.into_result().map_err(ClientError::Remote);
        match &result {
            Ok(_) => self.metrics.on_request_success(&pending.method, elapsed),
            Err(e) => self.metrics.on_request_error(&pending.method, elapsed, e),
        }
        let _ = pending.reply.send(result);
    }
}

async fn next_keepalive(keepalive: Option<&mut Keepalive>) -> KeepaliveEvent {
    match keepalive {
        Some(keepalive) => keepalive.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameChannel;
    use claw_proto::ClientInfo;
    use futures::future::BoxFuture;

    /// Connector that always refuses.
    struct Refusing;

    impl Connector for Refusing {
        fn connect(&self) -> BoxFuture<'_, ClientResult<FrameChannel>> {
            Box::pin(async { Err(ClientError::Transport("refused".to_string())) })
        }
    }

    /// Connector whose gateway accepts every handshake.
    struct Greeting;

    impl Connector for Greeting {
        fn connect(&self) -> BoxFuture<'_, ClientResult<FrameChannel>> {
            Box::pin(async {
                let (client_tx, mut server_rx) = mpsc::channel::<Frame>(8);
                let (server_tx, client_rx) = mpsc::channel::<Frame>(8);
                tokio::spawn(async move {
                    while let Some(frame) = server_rx.recv().await {
                        let Frame::Request(request) = frame else { continue };
                        let hello = HelloOk {
                            protocol: claw_proto::PROTOCOL_VERSION,
                            server: claw_proto::ServerInfo {
                                version: "test".to_string(),
                                conn_id: "conn-1".to_string(),
                            },
                            features: claw_proto::Features::default(),
                            snapshot: claw_proto::Snapshot::default(),
                            policy: HelloPolicy::default(),
                        };
                        let payload = hello.to_payload().ok();
                        let _ = server_tx.send(ResponseFrame::ok(request.id, payload).into()).await;
                    }
                });
                Ok(FrameChannel {
                    tx: client_tx,
                    rx: client_rx,
                })
            })
        }
    }

    fn options() -> ClientOptions {
        ClientOptions::new(ClientInfo {
            id: "test-client".to_string(),
            display_name: None,
            version: "0.1.0".to_string(),
            platform: "test".to_string(),
            mode: "operator".to_string(),
            instance_id: None,
        })
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = RpcClient::builder(options(), Refusing).build();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.pending_count(), 0);
        assert!(client.hello().is_none());
        assert_eq!(client.policy(), HelloPolicy::default());
    }

    #[tokio::test]
    async fn test_request_before_connect_fails_locally() {
        let client = RpcClient::builder(options(), Refusing).build();
        let result = client.request("node.list", None).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_first() {
        let client = RpcClient::builder(options(), Refusing).build();
        let big = Value::String("x".repeat(HelloPolicy::default().max_payload));
        let result = client.request("blob.put", Some(big)).await;
        assert!(matches!(result, Err(ClientError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let client = RpcClient::builder(options(), Refusing).build();
        client.stop();
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert!(client.wait_for_state(ConnectionState::Stopped).await);
        assert!(!client.wait_for_state(ConnectionState::Connected).await);

        // Start after stop does nothing.
        client.start();
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert!(matches!(
            client.request("x", None).await,
            Err(ClientError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_schedules_reconnect() {
        let client = RpcClient::builder(options(), Refusing).build();
        client.start();
        assert!(client.wait_for_state(ConnectionState::Reconnecting).await);
        assert_eq!(client.reconnect_attempts(), 1);
        client.stop();
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_stop_keeps_no_sender() {
        let client = RpcClient::builder(options(), Greeting).build();
        client.stop();

        let result = client.shared.connect_once().await;
        assert!(matches!(result, Err(ClientError::Stopped)));
        assert!(client.shared.outbound.lock().is_none());
        assert!(client.hello().is_none());
        assert_eq!(client.state(), ConnectionState::Stopped);
    }
}
