//! Agent worker behaviour over the in-memory broker: one reply per valid
//! request, independent replies on redelivery, and survival of malformed
//! input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::message::{Envelope, Payload, QoS};
use agentmesh_core::transport::{MemoryBroker, MemoryTransport, Transport};
use agentmesh_core::worker::{AgentWorker, TopicBinding, Transform, WorkerOptions, WorkerState};
use agentmesh_core::TransformError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Chat transform that answers locally instead of calling a model.
struct StubChat {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Transform for StubChat {
    fn name(&self) -> &str {
        "chat"
    }

    async fn apply(&self, payload: Payload) -> Result<Value, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Payload::Json(map) = payload else {
            return Err(TransformError::invalid("expected json"));
        };
        let input = map
            .get("user_input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TransformError::invalid("missing user_input"))?;
        Ok(json!({ "assistant_response": format!("echo: {}", input) }))
    }
}

struct Harness {
    worker: AgentWorker,
    caller: MemoryTransport,
    replies: mpsc::UnboundedReceiver<Envelope>,
    calls: Arc<AtomicUsize>,
}

async fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = AgentWorker::new(
        Arc::new(broker.connect("chat-worker")),
        Arc::new(StubChat {
            calls: calls.clone(),
        }),
        TopicBinding::new("1/chatbot/input_data", "1/chatbot/output_data"),
        WorkerOptions::default(),
    );
    worker.start().await.expect("worker should start");

    let caller = broker.connect("caller");
    let (tx, replies) = mpsc::unbounded_channel();
    caller
        .subscribe(
            "1/chatbot/output_data",
            QoS::AtLeastOnce,
            Arc::new(move |env: Envelope| {
                let _ = tx.send(env);
            }),
        )
        .await
        .expect("subscribe");

    Harness {
        worker,
        caller,
        replies,
        calls,
    }
}

impl Harness {
    async fn send(&self, payload: &[u8]) {
        self.caller
            .publish("1/chatbot/input_data", payload.to_vec(), QoS::AtLeastOnce)
            .await
            .expect("publish");
    }

    async fn next_reply(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(2), self.replies.recv())
            .await
            .ok()
            .flatten()
            .map(|env| serde_json::from_slice(&env.payload).expect("reply is JSON"))
    }

    async fn assert_quiet(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(150), self.replies.recv()).await;
        assert!(extra.is_err(), "unexpected extra reply: {:?}", extra);
    }
}

#[tokio::test]
async fn test_chat_round_trip_yields_exactly_one_reply() {
    let mut h = harness().await;
    h.send(br#"{"user_input": "ping"}"#).await;

    let reply = h.next_reply().await.expect("a reply within the bound");
    let text = reply["assistant_response"].as_str().expect("assistant_response string");
    assert!(!text.is_empty());
    assert_eq!(text, "echo: ping");
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_redelivery_produces_two_independent_replies() {
    let mut h = harness().await;
    let request = br#"{"user_input": "same", "request_id": "r-1"}"#;
    h.send(request).await;
    h.send(request).await;

    let first = h.next_reply().await.expect("first reply");
    let second = h.next_reply().await.expect("second reply");
    for reply in [&first, &second] {
        assert_eq!(reply["assistant_response"], "echo: same");
        assert_eq!(reply["request_id"], "r-1");
    }
    h.assert_quiet().await;
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_json_is_dropped_and_worker_keeps_going() {
    let mut h = harness().await;
    h.send(b"not-json").await;
    h.send(br#"{"user_input": "after"}"#).await;

    let reply = h.next_reply().await.expect("reply to the valid message");
    assert_eq!(reply["assistant_response"], "echo: after");
    h.assert_quiet().await;

    // The malformed message never reached the transform.
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.worker.processed(), 2);
    assert_eq!(h.worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn test_missing_field_is_dropped_without_reply() {
    let mut h = harness().await;
    h.send(br#"{"prompt": "wrong field"}"#).await;
    h.assert_quiet().await;

    h.send(br#"{"user_input": "ok"}"#).await;
    assert_eq!(h.next_reply().await.expect("reply")["assistant_response"], "echo: ok");
}

#[tokio::test]
async fn test_stop_halts_dispatch() {
    let mut h = harness().await;
    h.worker.stop().await.expect("stop");
    h.worker.stopped().await;

    h.send(br#"{"user_input": "late"}"#).await;
    h.assert_quiet().await;
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}
