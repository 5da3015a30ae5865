//! Node registry: connected sessions and correlated command invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use claw_proto::{
    new_request_id, EventFrame, Frame, InvokeRequestEvent, InvokeResultParams,
    EVENT_INVOKE_REQUEST,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{InvokeError, InvokeErrorCode, InvokeResult};
use crate::session::{NodeInfo, NodeSession, PendingInvoke};

/// A command to run on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    /// Target node id.
    pub node_id: String,
    /// Command name.
    pub command: String,
    /// Command parameters.
    pub params: Option<Value>,
    /// How long to wait for the node. `None` uses the registry default.
    pub timeout: Option<Duration>,
    /// Caller-supplied deduplication key, passed through to the node.
    pub idempotency_key: Option<String>,
}

impl InvokeRequest {
    /// Create a request with no parameters.
    #[must_use]
    pub fn new(node_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            command: command.into(),
            params: None,
            timeout: None,
            idempotency_key: None,
        }
    }

    /// Set the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Default)]
struct Sessions {
    /// Current session per node id.
    by_node: HashMap<String, Arc<NodeSession>>,
    /// Every live session per connection id.
    by_conn: HashMap<String, Arc<NodeSession>>,
}

/// Registry of connected nodes.
///
/// Sessions are shared behind `Arc`; the map lock is never held across an
/// await. Each session serializes its own pending set, so invokes to
/// different nodes never contend.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    config: RegistryConfig,
    sessions: RwLock<Sessions>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(Sessions::default()),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a node session.
    ///
    /// Registering a connection id that is already present replaces the old
    /// session; any calls still pending on it resolve `NODE_DISCONNECTED`.
    /// A node that reconnects under a new connection id takes over routing
    /// for its node id, while the old connection stays tracked until it is
    /// unregistered.
    pub fn register(&self, info: NodeInfo, sender: mpsc::Sender<Frame>) -> Arc<NodeSession> {
        let session = Arc::new(NodeSession::new(info, sender));
        let replaced = {
            let mut sessions = self.sessions.write();
            let replaced = sessions
                .by_conn
                .insert(session.conn_id().to_string(), Arc::clone(&session));
            if let Some(old) = &replaced {
                let owns_route = sessions
                    .by_node
                    .get(old.node_id())
                    .is_some_and(|current| Arc::ptr_eq(current, old));
                if owns_route {
                    sessions.by_node.remove(old.node_id());
                }
            }
            sessions
                .by_node
                .insert(session.node_id().to_string(), Arc::clone(&session));
            replaced
        };

        if let Some(old) = replaced {
            warn!(conn_id = %old.conn_id(), node_id = %old.node_id(), "replacing session with same connection id");
            Self::fail_pending(&old);
        }

        info!(
            conn_id = %session.conn_id(),
            node_id = %session.node_id(),
            platform = %session.info().platform,
            commands = session.info().commands.len(),
            "node registered"
        );
        session
    }

    /// Remove a connection, resolving its pending calls with
    /// `NODE_DISCONNECTED`.
    ///
    /// Returns the node id of the removed session, or `None` if the
    /// connection was not registered.
    pub fn unregister(&self, conn_id: &str) -> Option<String> {
        let session = {
            let mut sessions = self.sessions.write();
            let session = sessions.by_conn.remove(conn_id)?;
            let owns_route = sessions
                .by_node
                .get(session.node_id())
                .is_some_and(|current| Arc::ptr_eq(current, &session));
            if owns_route {
                sessions.by_node.remove(session.node_id());
            }
            session
        };

        let failed = Self::fail_pending(&session);
        info!(
            conn_id = %conn_id,
            node_id = %session.node_id(),
            failed_invokes = failed,
            "node unregistered"
        );
        Some(session.node_id().to_string())
    }

    fn fail_pending(session: &NodeSession) -> usize {
        let calls = session.close();
        let count = calls.len();
        for call in calls {
            call.cancel_and_resolve(Err(InvokeError::node_disconnected(session.node_id())));
        }
        count
    }

    /// Session currently routing for `node_id`.
    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions.read().by_node.get(node_id).cloned()
    }

    /// Session for a connection id.
    pub fn get_by_conn(&self, conn_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions.read().by_conn.get(conn_id).cloned()
    }

    /// Info for every node currently routable.
    pub fn list_connected(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .sessions
            .read()
            .by_node
            .values()
            .map(|session| session.info().clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Number of routable nodes.
    pub fn len(&self) -> usize {
        self.sessions.read().by_node.len()
    }

    /// Whether no node is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().by_node.is_empty()
    }

    /// In-flight invokes for `node_id`; zero for unknown nodes.
    pub fn pending_count(&self, node_id: &str) -> usize {
        self.get(node_id).map_or(0, |session| session.pending_count())
    }

    /// Push an event to a node. Returns `false` if the node is unknown or
    /// its connection is gone.
    pub async fn send_event(&self, node_id: &str, event: &str, payload: Option<Value>) -> bool {
        let Some(session) = self.get(node_id) else {
            return false;
        };
        session.send(EventFrame::new(event, payload).into()).await
    }

    /// Run a command on a node and wait for its result.
    ///
    /// Never fails with anything other than an [`InvokeError`]: an unknown
    /// node, a full pending set, a timeout, a disconnect, or the node's own
    /// error report.
    pub async fn invoke(&self, request: InvokeRequest) -> InvokeResult {
        let Some(session) = self.get(&request.node_id) else {
            debug!(node_id = %request.node_id, command = %request.command, "invoke for unknown node");
            return Err(InvokeError::node_not_found(&request.node_id));
        };

        let timeout = request.timeout.unwrap_or(self.config.default_invoke_timeout);
        let id = new_request_id();
        let event = InvokeRequestEvent {
            id: id.clone(),
            node_id: request.node_id.clone(),
            command: request.command.clone(),
            params_json: request.params.as_ref().map(Value::to_string),
            timeout_ms: Some(timeout.as_millis() as u64),
            idempotency_key: request.idempotency_key.clone(),
        };
        let payload = serde_json::to_value(&event).map_err(|e| {
            InvokeError::new(InvokeErrorCode::InvalidRequest, e.to_string())
        })?;

        let (reply, mut outcome) = oneshot::channel();
        {
            let mut pending = session.pending.lock();
            if pending.closed {
                return Err(InvokeError::node_disconnected(&request.node_id));
            }
            let max = self.config.max_pending_per_connection;
            if pending.calls.len() >= max {
                warn!(
                    node_id = %request.node_id,
                    command = %request.command,
                    max_pending = max,
                    "invoke rejected, pending set full"
                );
                return Err(InvokeError::queue_full(&request.node_id, max));
            }
            // The timer can only claim the entry through the same lock, so
            // spawning it here cannot race the insert.
            let timer = spawn_timeout(Arc::clone(&session), id.clone(), timeout);
            pending
                .calls
                .insert(id.clone(), PendingInvoke::new(request.command.clone(), timer, reply));
        }

        debug!(
            node_id = %request.node_id,
            command = %request.command,
            invoke_id = %id,
            timeout_ms = timeout.as_millis() as u64,
            "invoke dispatched"
        );

        let frame: Frame = EventFrame::new(EVENT_INVOKE_REQUEST, Some(payload)).into();
        tokio::select! {
            sent = session.send(frame) => {
                if !sent {
                    if let Some(call) = session.take(&id) {
                        call.cancel_and_resolve(Err(InvokeError::node_disconnected(&request.node_id)));
                    }
                }
            }
            // Resolved (timeout, disconnect) while the writer was backed up.
            result = &mut outcome => {
                return result.unwrap_or_else(|_| Err(InvokeError::node_disconnected(&request.node_id)));
            }
        }

        outcome
            .await
            .unwrap_or_else(|_| Err(InvokeError::node_disconnected(&request.node_id)))
    }

    /// Deliver a node's `node.invoke.result`.
    ///
    /// Returns `true` if it resolved a pending call. Results for unknown
    /// connections, from a node id other than the session's, or with an id
    /// that is not pending (already resolved, timed out, or never issued)
    /// are discarded.
    pub fn handle_invoke_result(&self, conn_id: &str, result: InvokeResultParams) -> bool {
        let Some(session) = self.get_by_conn(conn_id) else {
            debug!(conn_id = %conn_id, invoke_id = %result.id, "invoke result for unknown connection");
            return false;
        };
        if result.node_id != session.node_id() {
            warn!(
                conn_id = %conn_id,
                node_id = %session.node_id(),
                claimed_node_id = %result.node_id,
                "invoke result node id mismatch"
            );
            return false;
        }
        let Some(call) = session.take(&result.id) else {
            debug!(conn_id = %conn_id, invoke_id = %result.id, "discarding unmatched invoke result");
            return false;
        };

        debug!(
            node_id = %session.node_id(),
            command = %call.command,
            invoke_id = %result.id,
            ok = result.ok,
            elapsed_ms = call.submitted_at.elapsed().as_millis() as u64,
            "invoke resolved"
        );
        let outcome = if result.ok {
            Ok(result.resolved_payload())
        } else {
            Err(InvokeError::remote(result.error.as_ref()))
        };
        call.cancel_and_resolve(outcome);
        true
    }
}

fn spawn_timeout(
    session: Arc<NodeSession>,
    id: String,
    timeout: Duration,
) -> tokio::task::AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(call) = session.take(&id) {
            warn!(
                node_id = %session.node_id(),
                command = %call.command,
                invoke_id = %id,
                timeout_ms = timeout.as_millis() as u64,
                "invoke timed out"
            );
            let err = InvokeError::timeout(&call.command, timeout);
            call.resolve(Err(err));
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==================== Helper Functions ====================

    fn registry() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::new(RegistryConfig::default()))
    }

    fn register(
        registry: &NodeRegistry,
        conn_id: &str,
        node_id: &str,
    ) -> (Arc<NodeSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        let session = registry.register(NodeInfo::new(conn_id, node_id), tx);
        (session, rx)
    }

    async fn next_invoke(rx: &mut mpsc::Receiver<Frame>) -> InvokeRequestEvent {
        match rx.recv().await {
            Some(Frame::Event(event)) => {
                assert_eq!(event.event, EVENT_INVOKE_REQUEST);
                serde_json::from_value(event.payload.unwrap_or_default())
                    .unwrap_or_else(|e| panic!("bad invoke payload: {e}"))
            }
            other => panic!("expected invoke event, got {other:?}"),
        }
    }

    // ==================== Register Tests ====================

    #[test]
    fn test_registry_new_is_empty() {
        let registry = NodeRegistry::new(RegistryConfig::default());
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list_connected().is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        let (_s1, _rx1) = register(&registry, "c1", "node-b");
        let (_s2, _rx2) = register(&registry, "c2", "node-a");

        assert_eq!(registry.len(), 2);
        assert!(registry.get("node-a").is_some());
        assert_eq!(
            registry.get_by_conn("c1").map(|s| s.node_id().to_string()),
            Some("node-b".to_string())
        );
        let ids: Vec<_> = registry.list_connected().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[test]
    fn test_unregister_returns_node_id_once() {
        let registry = registry();
        let (_s, _rx) = register(&registry, "c1", "node-a");

        assert_eq!(registry.unregister("c1").as_deref(), Some("node-a"));
        assert!(registry.unregister("c1").is_none());
        assert!(registry.get("node-a").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_under_new_conn_keeps_route() {
        let registry = registry();
        let (old, _rx1) = register(&registry, "c1", "node-a");
        let (new, _rx2) = register(&registry, "c2", "node-a");

        assert_eq!(registry.len(), 1);
        assert!(registry.get("node-a").is_some_and(|s| Arc::ptr_eq(&s, &new)));

        // The stale connection's cleanup must not remove the new route.
        assert_eq!(registry.unregister("c1").as_deref(), Some("node-a"));
        assert!(old.is_closed());
        assert!(registry.get("node-a").is_some_and(|s| Arc::ptr_eq(&s, &new)));
    }

    #[tokio::test]
    async fn test_reregister_conn_under_other_node_drops_old_route() {
        let registry = registry();
        let (old, _rx1) = register(&registry, "c1", "node-a");
        let (_new, _rx2) = register(&registry, "c1", "node-b");

        assert!(old.is_closed());
        assert!(registry.get("node-a").is_none());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.unregister("c1").as_deref(), Some("node-b"));
        assert!(registry.is_empty());
        let err = registry
            .invoke(InvokeRequest::new("node-a", "system.run"))
            .await
            .err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeNotFound));
    }

    // ==================== Invoke Tests ====================

    #[tokio::test]
    async fn test_invoke_unknown_node() {
        let registry = registry();
        let err = registry
            .invoke(InvokeRequest::new("ghost", "system.run"))
            .await
            .err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeNotFound));
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .invoke(
                        InvokeRequest::new("node-a", "system.run")
                            .with_params(json!({"cmd": ["uptime"]}))
                            .with_idempotency_key("k-1"),
                    )
                    .await
            })
        };

        let request = next_invoke(&mut rx).await;
        assert_eq!(request.node_id, "node-a");
        assert_eq!(request.command, "system.run");
        assert_eq!(request.params(), json!({"cmd": ["uptime"]}));
        assert_eq!(request.timeout_ms, Some(30_000));
        assert_eq!(request.idempotency_key.as_deref(), Some("k-1"));
        assert_eq!(registry.pending_count("node-a"), 1);

        assert!(registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-a", json!({"stdout": "up 3 days"})),
        ));

        let result = caller.await.unwrap_or_else(|e| panic!("join: {e}"));
        assert_eq!(result, Ok(json!({"stdout": "up 3 days"})));
        assert_eq!(registry.pending_count("node-a"), 0);
    }

    #[tokio::test]
    async fn test_invoke_remote_error() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(InvokeRequest::new("node-a", "camera.snap")).await })
        };
        let request = next_invoke(&mut rx).await;
        assert!(request.params_json.is_none());
        assert!(registry.handle_invoke_result(
            "c1",
            InvokeResultParams::failure(&request.id, "node-a", "CAMERA_BUSY", "in use"),
        ));

        let err = caller.await.unwrap_or_else(|e| panic!("join: {e}")).err();
        assert_eq!(
            err.map(|e| (e.code, e.message)),
            Some((InvokeErrorCode::Remote("CAMERA_BUSY".into()), "in use".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invoke_payload_json_fallback() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(InvokeRequest::new("node-a", "x")).await })
        };
        let request = next_invoke(&mut rx).await;
        let mut result = InvokeResultParams::success(&request.id, "node-a", Value::Null);
        result.payload = None;
        result.payload_json = Some(r#"{"n":1}"#.to_string());
        assert!(registry.handle_invoke_result("c1", result));

        assert_eq!(
            caller.await.unwrap_or_else(|e| panic!("join: {e}")),
            Ok(json!({"n": 1}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_timeout() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .invoke(InvokeRequest::new("node-a", "slow").with_timeout(Duration::from_millis(200)))
                    .await
            })
        };
        let request = next_invoke(&mut rx).await;

        let err = caller.await.unwrap_or_else(|e| panic!("join: {e}")).err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::Timeout));
        assert_eq!(registry.pending_count("node-a"), 0);

        // A late reply finds nothing to resolve.
        assert!(!registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-a", Value::Null),
        ));
    }

    #[tokio::test]
    async fn test_invoke_send_failure_is_disconnect() {
        let registry = registry();
        let (_session, rx) = register(&registry, "c1", "node-a");
        drop(rx);

        let err = registry.invoke(InvokeRequest::new("node-a", "x")).await.err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeDisconnected));
        assert_eq!(registry.pending_count("node-a"), 0);
    }

    // ==================== Result Routing Tests ====================

    #[tokio::test]
    async fn test_result_from_other_connection_is_discarded() {
        let registry = registry();
        let (_a, mut rx_a) = register(&registry, "c1", "node-a");
        let (_b, _rx_b) = register(&registry, "c2", "node-b");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(InvokeRequest::new("node-a", "x")).await })
        };
        let request = next_invoke(&mut rx_a).await;

        assert!(!registry.handle_invoke_result(
            "c2",
            InvokeResultParams::success(&request.id, "node-b", Value::Null),
        ));
        assert!(!registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-b", Value::Null),
        ));
        assert!(!registry.handle_invoke_result(
            "nope",
            InvokeResultParams::success(&request.id, "node-a", Value::Null),
        ));
        assert_eq!(registry.pending_count("node-a"), 1);

        assert!(registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-a", json!(true)),
        ));
        assert_eq!(caller.await.unwrap_or_else(|e| panic!("join: {e}")), Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_duplicate_result_resolves_once() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(InvokeRequest::new("node-a", "x")).await })
        };
        let request = next_invoke(&mut rx).await;

        assert!(registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-a", json!(1)),
        ));
        assert!(!registry.handle_invoke_result(
            "c1",
            InvokeResultParams::success(&request.id, "node-a", json!(2)),
        ));
        assert_eq!(caller.await.unwrap_or_else(|e| panic!("join: {e}")), Ok(json!(1)));
    }

    // ==================== Send Event Tests ====================

    #[tokio::test]
    async fn test_send_event() {
        let registry = registry();
        let (_session, mut rx) = register(&registry, "c1", "node-a");

        assert!(registry.send_event("node-a", "tick", Some(json!({"ts": 1}))).await);
        assert!(!registry.send_event("ghost", "tick", None).await);

        match rx.recv().await {
            Some(Frame::Event(event)) => {
                assert_eq!(event.event, "tick");
                assert_eq!(event.payload, Some(json!({"ts": 1})));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }
}
