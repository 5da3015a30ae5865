//! Per-connection WebSocket session.
//!
//! A session reads the `connect` request, answers with `hello-ok` (or a
//! rejection), then pumps frames until either side goes away. Node-role
//! sessions are admitted into the registry for their lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use claw_gateway::{NodeInfo, NodeSession};
use claw_proto::{
    negotiate_protocol, ConnectParams, ErrorShape, EventFrame, Features, Frame, HelloOk,
    RequestFrame, ResponseFrame, ServerInfo, Snapshot, EVENT_HEARTBEAT, EVENT_TICK,
    MAX_PROTOCOL_VERSION, METHOD_CONNECT, METHOD_INVOKE_RESULT, MIN_PROTOCOL_VERSION,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ServerError, ServerResult};
use crate::handlers::{
    handle_invoke_result, handle_node_invoke, handle_node_list, supported_events,
    supported_methods, unknown_method, ERROR_INVALID_REQUEST, ERROR_PROTOCOL_MISMATCH,
    ERROR_RATE_LIMITED, METHOD_NODE_INVOKE, METHOD_NODE_LIST,
};
use crate::server::ServerState;

/// Role whose connections are admitted into the node registry.
pub const ROLE_NODE: &str = "node";

/// Tracks message size violations for a connection.
#[derive(Debug, Default)]
pub struct ViolationTracker {
    count: u32,
}

impl ViolationTracker {
    /// Create a new violation tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Record a violation and return the current count.
    pub fn record_violation(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Get the current violation count.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Returns true once the count is past `max_violations`.
    #[must_use]
    pub const fn should_terminate(&self, max_violations: u32) -> bool {
        self.count > max_violations
    }
}

/// Get the size of a WebSocket message in bytes.
#[must_use]
pub fn ws_message_size(ws_msg: &WsMessage) -> usize {
    match ws_msg {
        WsMessage::Text(text) => text.len(),
        WsMessage::Binary(data) | WsMessage::Ping(data) | WsMessage::Pong(data) => data.len(),
        WsMessage::Close(frame) => frame.as_ref().map_or(0, |f| f.reason.len() + 2),
        WsMessage::Frame(frame) => frame.len(),
    }
}

/// Decode one WebSocket message into a protocol frame.
///
/// Control messages yield `Ok(None)`.
///
/// # Errors
///
/// Returns [`ServerError::MessageTooLarge`] above `max_payload`,
/// [`ServerError::ConnectionClosed`] for a close message, and
/// [`ServerError::Serialization`] for anything that is not a frame.
pub fn decode_ws_message(ws_msg: &WsMessage, max_payload: usize) -> ServerResult<Option<Frame>> {
    let size = ws_message_size(ws_msg);
    if size > max_payload {
        return Err(ServerError::MessageTooLarge {
            size,
            limit: max_payload,
        });
    }
    match ws_msg {
        WsMessage::Text(text) => Ok(Some(Frame::from_json(text)?)),
        WsMessage::Binary(data) => {
            let text = std::str::from_utf8(data)
                .map_err(|e| ServerError::Serialization(e.to_string()))?;
            Ok(Some(Frame::from_json(text)?))
        }
        WsMessage::Close(_) => Err(ServerError::ConnectionClosed),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
    }
}

/// Encode a frame as a WebSocket text message.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn frame_to_ws(frame: &Frame) -> ServerResult<WsMessage> {
    Ok(WsMessage::Text(frame.to_json()?))
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> ServerResult<()>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    sink.send(frame_to_ws(frame)?).await?;
    Ok(())
}

/// Read until the first request. Control messages are skipped.
async fn read_first_request<S>(stream: &mut S, max_payload: usize) -> ServerResult<RequestFrame>
where
    S: futures::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match decode_ws_message(&msg?, max_payload)? {
            Some(Frame::Request(request)) => return Ok(request),
            Some(other) => {
                return Err(ServerError::Handshake(format!(
                    "expected connect request, got {}",
                    other.kind()
                )));
            }
            None => {}
        }
    }
    Err(ServerError::ConnectionClosed)
}

fn tick_timer(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut timer = interval_at(Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// An accepted, handshake-complete connection.
struct Connection {
    state: Arc<ServerState>,
    conn_id: String,
    node: Option<Arc<NodeSession>>,
    outbound: mpsc::Sender<Frame>,
}

impl Connection {
    fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        if let Some(node) = &self.node {
            node.touch();
        }
        match frame {
            Frame::Event(event) if event.event == EVENT_HEARTBEAT => {
                trace!(conn_id = %self.conn_id, "heartbeat");
                None
            }
            Frame::Event(event) => {
                debug!(conn_id = %self.conn_id, event = %event.event, "ignoring client event");
                None
            }
            Frame::Response(response) => {
                debug!(conn_id = %self.conn_id, request_id = %response.id, "ignoring client response");
                None
            }
            Frame::Request(request) => self.handle_request(request).map(Frame::from),
        }
    }

    fn handle_request(&self, request: RequestFrame) -> Option<ResponseFrame> {
        match request.method.as_str() {
            METHOD_INVOKE_RESULT => Some(handle_invoke_result(
                &self.state.registry,
                &self.conn_id,
                &request,
            )),
            METHOD_NODE_LIST => Some(handle_node_list(&self.state.registry, &request)),
            METHOD_NODE_INVOKE => {
                // Invokes can take as long as the node does; reply from a task.
                let invoker = Arc::clone(&self.state.invoker);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let response = handle_node_invoke(&invoker, request).await;
                    let _ = outbound.send(response.into()).await;
                });
                None
            }
            METHOD_CONNECT => Some(ResponseFrame::error(
                request.id,
                ErrorShape::new(ERROR_INVALID_REQUEST, "connection already established"),
            )),
            other => {
                warn!(conn_id = %self.conn_id, method = %other, "unknown method");
                Some(unknown_method(&request))
            }
        }
    }
}

/// Run one client connection from WebSocket upgrade to close.
///
/// # Errors
///
/// Returns an error if the upgrade or the handshake fails. Errors after the
/// handshake end the session and are logged, not returned.
pub(crate) async fn run_connection<S>(
    state: Arc<ServerState>,
    stream: S,
    peer: SocketAddr,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &state.config;
    let max_payload = config.policy.max_payload;
    let ws_stream = tokio_tungstenite::accept_async_with_config(
        stream,
        Some(config.websocket.transport_config()),
    )
    .await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let connect = tokio::time::timeout(
        config.handshake_timeout,
        read_first_request(&mut ws_stream, max_payload),
    )
    .await
    .map_err(|_| ServerError::Handshake("timed out waiting for connect".into()))??;

    let reject = |code: &str, message: String| {
        Frame::from(ResponseFrame::error(connect.id.clone(), ErrorShape::new(code, message)))
    };

    if connect.method != METHOD_CONNECT {
        let frame = reject(ERROR_INVALID_REQUEST, "first request must be connect".into());
        send_frame(&mut ws_sink, &frame).await?;
        let _ = ws_sink.close().await;
        return Err(ServerError::Handshake(format!(
            "first request was {}",
            connect.method
        )));
    }

    let decision = state.limiter.check(&peer.ip());
    if !decision.allowed {
        let retry_after_ms = decision.retry_after.as_millis() as u64;
        warn!(peer = %peer, retry_after_ms, "handshake rate limited");
        let shape = ErrorShape::new(ERROR_RATE_LIMITED, "too many connection attempts")
            .with_retry_after(retry_after_ms);
        send_frame(&mut ws_sink, &ResponseFrame::error(connect.id.clone(), shape).into()).await?;
        let _ = ws_sink.close().await;
        return Ok(());
    }

    let params = match connect
        .parse_params::<ConnectParams>()
        .and_then(|params| params.validate().map(|()| params))
    {
        Ok(params) => params,
        Err(e) => {
            send_frame(&mut ws_sink, &reject(ERROR_INVALID_REQUEST, e.to_string())).await?;
            let _ = ws_sink.close().await;
            return Err(ServerError::Handshake(e.to_string()));
        }
    };

    let protocol = match negotiate_protocol(
        params.min_protocol,
        params.max_protocol,
        MIN_PROTOCOL_VERSION,
        MAX_PROTOCOL_VERSION,
    ) {
        Ok(protocol) => protocol,
        Err(e) => {
            send_frame(&mut ws_sink, &reject(ERROR_PROTOCOL_MISMATCH, e.to_string())).await?;
            let _ = ws_sink.close().await;
            return Err(ServerError::Handshake(e.to_string()));
        }
    };

    let conn_id = uuid::Uuid::new_v4().to_string();
    let hello = HelloOk {
        protocol,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.clone(),
        },
        features: Features {
            methods: supported_methods(),
            events: supported_events(),
        },
        snapshot: Snapshot {
            uptime_ms: state.started.elapsed().as_millis() as u64,
            ..Snapshot::default()
        },
        policy: config.policy,
    };
    let hello_frame = ResponseFrame::ok(connect.id.clone(), Some(hello.to_payload()?));
    send_frame(&mut ws_sink, &hello_frame.into()).await?;

    let (outbound, mut outbound_rx) = mpsc::channel(config.websocket.outbound_buffer);
    let node = (params.role == ROLE_NODE).then(|| {
        let info = NodeInfo::from_connect(&conn_id, &params, protocol, Some(peer.ip()));
        state.registry.register(info, outbound.clone())
    });
    info!(
        conn_id = %conn_id,
        peer = %peer,
        client_id = %params.client.id,
        role = %params.role,
        protocol,
        "client connected"
    );

    let connection = Connection {
        state: Arc::clone(&state),
        conn_id,
        node,
        outbound,
    };
    let mut violations = ViolationTracker::new();
    let mut ticker = tick_timer(config.policy.tick_interval());

    let reason = loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => break "server shutting down",
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else { break "outbound closed" };
                if let Err(e) = send_frame(&mut ws_sink, &frame).await {
                    warn!(conn_id = %connection.conn_id, error = %e, "write failed");
                    break "write failed";
                }
            }
            () = next_tick(ticker.as_mut()) => {
                let tick = EventFrame::new(EVENT_TICK, None);
                if let Err(e) = send_frame(&mut ws_sink, &tick.into()).await {
                    warn!(conn_id = %connection.conn_id, error = %e, "tick write failed");
                    break "write failed";
                }
            }
            inbound = ws_stream.next() => {
                let ws_msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(conn_id = %connection.conn_id, error = %e, "WebSocket read error");
                        break "read failed";
                    }
                    None => break "peer closed",
                };
                let frame = match decode_ws_message(&ws_msg, max_payload) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(ServerError::ConnectionClosed) => break "peer closed",
                    Err(ServerError::MessageTooLarge { size, limit }) => {
                        let count = violations.record_violation();
                        warn!(
                            conn_id = %connection.conn_id,
                            size,
                            limit,
                            violations = count,
                            "Received oversized frame"
                        );
                        if violations.should_terminate(config.websocket.max_violations) {
                            error!(
                                conn_id = %connection.conn_id,
                                violations = count,
                                "Terminating connection due to repeated size violations"
                            );
                            break "too many oversized frames";
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(conn_id = %connection.conn_id, error = %e, "discarding malformed frame");
                        continue;
                    }
                };
                if let Some(reply) = connection.handle_frame(frame) {
                    if let Err(e) = send_frame(&mut ws_sink, &reply).await {
                        warn!(conn_id = %connection.conn_id, error = %e, "write failed");
                        break "write failed";
                    }
                }
            }
        }
    };

    if connection.node.is_some() {
        state.registry.unregister(&connection.conn_id);
    }
    let _ = ws_sink.close().await;
    info!(conn_id = %connection.conn_id, reason = %reason, "client disconnected");
    Ok(())
}
