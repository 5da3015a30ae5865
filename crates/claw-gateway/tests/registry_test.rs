//! Integration tests for node registry invocation under load and disconnect.

use std::sync::Arc;
use std::time::Duration;

use claw_gateway::{InvokeErrorCode, InvokeRequest, InvokeResult, NodeInfo, NodeRegistry, RegistryConfig};
use claw_proto::{Frame, InvokeRequestEvent, InvokeResultParams};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ==================== Helper Functions ====================

fn setup(config: RegistryConfig, channel: usize) -> (Arc<NodeRegistry>, mpsc::Receiver<Frame>) {
    let registry = Arc::new(NodeRegistry::new(config));
    let (tx, rx) = mpsc::channel(channel);
    registry.register(NodeInfo::new("conn-1", "node-1"), tx);
    (registry, rx)
}

fn spawn_invoke(registry: &Arc<NodeRegistry>, request: InvokeRequest) -> JoinHandle<InvokeResult> {
    let registry = Arc::clone(registry);
    tokio::spawn(async move { registry.invoke(request).await })
}

fn decode(frame: Frame) -> InvokeRequestEvent {
    match frame {
        Frame::Event(event) => serde_json::from_value(event.payload.unwrap_or_default())
            .unwrap_or_else(|e| panic!("bad invoke payload: {e}")),
        other => panic!("expected invoke event, got {other:?}"),
    }
}

async fn wait_for_pending(registry: &NodeRegistry, node_id: &str, count: usize) {
    while registry.pending_count(node_id) < count {
        tokio::task::yield_now().await;
    }
}

// ==================== Backpressure Tests ====================

#[tokio::test]
async fn test_pending_bound_rejects_1001st_invoke() {
    let (registry, mut rx) = setup(RegistryConfig::default(), 2048);

    let callers: Vec<_> = (0..1000)
        .map(|i| spawn_invoke(&registry, InvokeRequest::new("node-1", format!("cmd-{i}"))))
        .collect();
    for _ in 0..1000 {
        decode(rx.recv().await.unwrap_or_else(|| panic!("no frame")));
    }
    assert_eq!(registry.pending_count("node-1"), 1000);

    let err = registry.invoke(InvokeRequest::new("node-1", "one-too-many")).await.err();
    assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::QueueFull));
    assert!(rx.try_recv().is_err(), "a rejected invoke must not reach the node");
    assert_eq!(registry.pending_count("node-1"), 1000);

    registry.unregister("conn-1");
    for caller in callers {
        let err = caller.await.unwrap_or_else(|e| panic!("join: {e}")).err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeDisconnected));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_bound_is_exact_under_concurrency() {
    let config = RegistryConfig::default().with_max_pending(50);
    let (registry, _rx) = setup(config, 512);

    let callers: Vec<_> = (0..80)
        .map(|_| spawn_invoke(&registry, InvokeRequest::new("node-1", "x")))
        .collect();

    // Rejections resolve immediately; admitted calls stay pending.
    while callers.iter().filter(|c| c.is_finished()).count() < 30
        || registry.pending_count("node-1") < 50
    {
        tokio::task::yield_now().await;
    }
    assert_eq!(registry.pending_count("node-1"), 50);

    registry.unregister("conn-1");
    let mut disconnected = 0;
    let mut rejected = 0;
    for caller in callers {
        match caller.await.unwrap_or_else(|e| panic!("join: {e}")) {
            Err(e) if e.code == InvokeErrorCode::NodeDisconnected => disconnected += 1,
            Err(e) if e.code == InvokeErrorCode::QueueFull => rejected += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(disconnected, 50);
    assert_eq!(rejected, 30);
}

// ==================== Disconnect Tests ====================

#[tokio::test]
async fn test_unregister_fails_every_pending_invoke() {
    let (registry, _rx) = setup(RegistryConfig::default(), 64);

    let callers: Vec<_> = (0..10)
        .map(|_| spawn_invoke(&registry, InvokeRequest::new("node-1", "x")))
        .collect();
    wait_for_pending(&registry, "node-1", 10).await;

    assert_eq!(registry.unregister("conn-1").as_deref(), Some("node-1"));
    assert!(registry.unregister("conn-1").is_none());

    for caller in callers {
        let err = caller.await.unwrap_or_else(|e| panic!("join: {e}")).err();
        assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeDisconnected));
    }

    let err = registry.invoke(InvokeRequest::new("node-1", "x")).await.err();
    assert_eq!(err.map(|e| e.code), Some(InvokeErrorCode::NodeNotFound));
}

#[tokio::test]
async fn test_reregister_same_conn_invalidates_old_session() {
    let (registry, _rx) = setup(RegistryConfig::default(), 8);
    let session = registry.get("node-1").unwrap_or_else(|| panic!("registered"));

    // Re-register the same connection id: the old session is invalidated.
    let (tx, _rx2) = mpsc::channel(8);
    registry.register(NodeInfo::new("conn-1", "node-1"), tx);
    assert!(session.is_closed());
    assert_eq!(registry.len(), 1);
}

// ==================== Race Tests ====================

#[tokio::test(start_paused = true)]
async fn test_reply_after_timeout_is_discarded() {
    let (registry, mut rx) = setup(RegistryConfig::default(), 8);

    let caller = spawn_invoke(
        &registry,
        InvokeRequest::new("node-1", "slow").with_timeout(Duration::from_millis(100)),
    );
    let request = decode(rx.recv().await.unwrap_or_else(|| panic!("no frame")));

    let result = caller.await.unwrap_or_else(|e| panic!("join: {e}"));
    assert_eq!(result.err().map(|e| e.code), Some(InvokeErrorCode::Timeout));

    assert!(!registry.handle_invoke_result(
        "conn-1",
        InvokeResultParams::success(&request.id, "node-1", json!("late")),
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reply_before_timeout_cancels_timer() {
    let (registry, mut rx) = setup(RegistryConfig::default(), 8);

    let caller = spawn_invoke(
        &registry,
        InvokeRequest::new("node-1", "fast").with_timeout(Duration::from_millis(100)),
    );
    let request = decode(rx.recv().await.unwrap_or_else(|| panic!("no frame")));
    assert_eq!(request.timeout_ms, Some(100));

    assert!(registry.handle_invoke_result(
        "conn-1",
        InvokeResultParams::success(&request.id, "node-1", json!("fast")),
    ));
    assert_eq!(caller.await.unwrap_or_else(|e| panic!("join: {e}")), Ok(json!("fast")));

    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(registry.pending_count("node-1"), 0);
}

#[tokio::test]
async fn test_interleaved_replies_correlate_by_id() {
    let (registry, mut rx) = setup(RegistryConfig::default(), 8);

    let first = spawn_invoke(&registry, InvokeRequest::new("node-1", "a"));
    let second = spawn_invoke(&registry, InvokeRequest::new("node-1", "b"));

    let mut requests = vec![
        decode(rx.recv().await.unwrap_or_else(|| panic!("no frame"))),
        decode(rx.recv().await.unwrap_or_else(|| panic!("no frame"))),
    ];
    requests.sort_by(|x, y| x.command.cmp(&y.command));

    // Answer in reverse order.
    for request in requests.iter().rev() {
        assert!(registry.handle_invoke_result(
            "conn-1",
            InvokeResultParams::success(&request.id, "node-1", json!(request.command)),
        ));
    }

    assert_eq!(first.await.unwrap_or_else(|e| panic!("join: {e}")), Ok(json!("a")));
    assert_eq!(second.await.unwrap_or_else(|e| panic!("join: {e}")), Ok(json!("b")));
}
