//! Correlator behaviour against stub responders on the in-memory broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentmesh_core::correlator::{CorrelationMode, Correlator};
use agentmesh_core::message::{Envelope, ErrorEnvelope, Payload, QoS, REQUEST_ID_FIELD};
use agentmesh_core::transport::{MemoryBroker, MemoryTransport, Transport};
use agentmesh_core::MeshError;
use serde_json::{json, Map, Value};

const IN: &str = "1/chatbot/input_data";
const OUT: &str = "1/chatbot/output_data";

fn request(text: &str) -> Payload {
    Payload::Json(
        json!({ "user_input": text })
            .as_object()
            .cloned()
            .expect("object"),
    )
}

/// Replies to every request on its own task after a delay picked by
/// `delay_for(user_input)`, echoing any request id. Unlike a real worker it
/// does not serialize requests, so replies can overtake each other.
async fn spawn_responder(
    broker: &MemoryBroker,
    delay_for: fn(&str) -> Duration,
    reply_for: fn(&str) -> Value,
    published: Arc<AtomicBool>,
) -> Arc<MemoryTransport> {
    let transport = Arc::new(broker.connect("stub-agent"));
    let publisher = transport.clone();
    transport
        .subscribe(
            IN,
            QoS::AtLeastOnce,
            Arc::new(move |env: Envelope| {
                let publisher = publisher.clone();
                let published = published.clone();
                tokio::spawn(async move {
                    let request: Map<String, Value> = env.json_object().expect("stub gets JSON");
                    let input = request
                        .get("user_input")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    tokio::time::sleep(delay_for(&input)).await;

                    let mut reply = reply_for(&input);
                    if let (Some(id), Some(map)) = (request.get(REQUEST_ID_FIELD), reply.as_object_mut()) {
                        map.insert(REQUEST_ID_FIELD.to_string(), id.clone());
                    }
                    published.store(true, Ordering::SeqCst);
                    publisher
                        .publish(OUT, reply.to_string().into_bytes(), QoS::AtLeastOnce)
                        .await
                        .expect("stub publish");
                });
            }),
        )
        .await
        .expect("stub subscribe");
    transport
}

fn pong(_: &str) -> Value {
    json!({ "assistant_response": "pong" })
}

fn echo(input: &str) -> Value {
    json!({ "assistant_response": input })
}

fn fixed_delay(_: &str) -> Duration {
    Duration::from_millis(200)
}

fn slow_or_fast(input: &str) -> Duration {
    if input == "slow" {
        Duration::from_millis(300)
    } else {
        Duration::from_millis(30)
    }
}

#[tokio::test]
async fn test_returns_delayed_reply_only_after_it_is_published() {
    let broker = MemoryBroker::new();
    let published = Arc::new(AtomicBool::new(false));
    let _stub = spawn_responder(&broker, fixed_delay, pong, published.clone()).await;

    let correlator = Correlator::new(Arc::new(broker.connect("orchestrator")));
    let started = Instant::now();
    let reply = correlator
        .send_and_wait(IN, OUT, request("ping"), Duration::from_secs(2))
        .await
        .expect("reply");

    assert!(published.load(Ordering::SeqCst));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(reply["assistant_response"], "pong");
    assert!(reply.contains_key(REQUEST_ID_FIELD));
    assert_eq!(correlator.pending(), 0);
}

#[tokio::test]
async fn test_times_out_when_nobody_answers() {
    let broker = MemoryBroker::new();
    let correlator = Correlator::new(Arc::new(broker.connect("orchestrator")));

    let err = correlator
        .send_and_wait(IN, OUT, request("anyone?"), Duration::from_millis(100))
        .await
        .expect_err("no responder");
    match err {
        MeshError::Timeout { topic, waited_ms } => {
            assert_eq!(topic, OUT);
            assert_eq!(waited_ms, 100);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(correlator.pending(), 0);
}

#[tokio::test]
async fn test_error_envelope_becomes_agent_failed() {
    let broker = MemoryBroker::new();
    fn failure(_: &str) -> Value {
        ErrorEnvelope::new("chat", "model offline", None).to_value()
    }
    let _stub = spawn_responder(&broker, slow_or_fast, failure, Arc::new(AtomicBool::new(false))).await;

    let correlator = Correlator::new(Arc::new(broker.connect("orchestrator")));
    let err = correlator
        .send_and_wait(IN, OUT, request("x"), Duration::from_secs(2))
        .await
        .expect_err("agent failure");
    assert!(matches!(
        err,
        MeshError::AgentFailed { ref agent, ref message } if agent == "chat" && message == "model offline"
    ));
}

#[tokio::test]
async fn test_abandoned_call_does_not_swallow_the_next_reply() {
    let broker = MemoryBroker::new();
    let _stub = spawn_responder(&broker, fixed_delay, echo, Arc::new(AtomicBool::new(false))).await;
    let correlator = Correlator::with_mode(Arc::new(broker.connect("orchestrator")), CorrelationMode::TopicOnly);

    // The caller gives up long before the 200ms reply.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        correlator.send_and_wait(IN, OUT, request("first"), Duration::from_secs(2)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(correlator.pending(), 0);

    // Topic-only matching hands the first reply to the live caller.
    let reply = correlator
        .send_and_wait(IN, OUT, request("second"), Duration::from_secs(2))
        .await
        .expect("reply");
    assert_eq!(reply["assistant_response"], "first");
}

async fn overlapping_calls(mode: CorrelationMode) -> (String, String) {
    let broker = MemoryBroker::new();
    let _stub = spawn_responder(&broker, slow_or_fast, echo, Arc::new(AtomicBool::new(false))).await;
    let correlator = Correlator::with_mode(Arc::new(broker.connect("orchestrator")), mode);

    let slow = correlator.send_and_wait(IN, OUT, request("slow"), Duration::from_secs(2));
    let fast = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        correlator
            .send_and_wait(IN, OUT, request("fast"), Duration::from_secs(2))
            .await
    };
    let (slow, fast) = tokio::join!(slow, fast);
    let text = |r: agentmesh_core::MeshResult<Map<String, Value>>| {
        r.expect("reply")["assistant_response"]
            .as_str()
            .expect("text")
            .to_string()
    };
    (text(slow), text(fast))
}

#[tokio::test]
async fn test_topic_only_overlapping_calls_swap_replies() {
    let (slow, fast) = overlapping_calls(CorrelationMode::TopicOnly).await;
    assert_eq!(slow, "fast");
    assert_eq!(fast, "slow");
}

#[tokio::test]
async fn test_request_id_overlapping_calls_keep_their_replies() {
    let (slow, fast) = overlapping_calls(CorrelationMode::RequestId).await;
    assert_eq!(slow, "slow");
    assert_eq!(fast, "fast");
}
