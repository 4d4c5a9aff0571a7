//! Request/response correlation over an asynchronous transport.
//!
//! `send_and_wait(input_topic, output_topic, request, timeout)`:
//!   1. Subscribe to `output_topic` once (the subscription is kept for
//!      later calls).
//!   2. Register a waiter for the reply, then publish the request.
//!   3. Suspend on a oneshot channel until the matching reply arrives or
//!      `timeout` elapses.
//!
//! Matching depends on [`CorrelationMode`]:
//! - `RequestId`: a fresh `request_id` is embedded in JSON requests and a
//!   reply is handed only to the waiter with the same id. Binary requests
//!   cannot carry an id; replies without one go to the oldest waiter that
//!   also has none.
//! - `TopicOnly`: the oldest waiter on the topic takes whatever arrives
//!   next. Two overlapping calls on one topic pair can receive each other's
//!   replies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::{MeshError, MeshResult};
use crate::message::{
    new_request_id, request_id_of, Envelope, ErrorEnvelope, Payload, QoS, REQUEST_ID_FIELD,
};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    #[default]
    RequestId,
    TopicOnly,
}

pub type Reply = Map<String, Value>;

struct Waiter {
    seq: u64,
    request_id: Option<String>,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Pending {
    by_topic: HashMap<String, VecDeque<Waiter>>,
}

impl Pending {
    fn register(&mut self, topic: &str, waiter: Waiter) {
        self.by_topic.entry(topic.to_string()).or_default().push_back(waiter);
    }

    fn remove(&mut self, topic: &str, seq: u64) {
        if let Some(queue) = self.by_topic.get_mut(topic) {
            queue.retain(|w| w.seq != seq);
        }
    }

    fn take_match(&mut self, topic: &str, mode: CorrelationMode, reply: &Reply) -> Option<Waiter> {
        let queue = self.by_topic.get_mut(topic)?;
        let index = match mode {
            CorrelationMode::TopicOnly => 0,
            CorrelationMode::RequestId => match request_id_of(reply) {
                Some(id) => queue
                    .iter()
                    .position(|w| w.request_id.as_deref() == Some(id))?,
                None => queue.iter().position(|w| w.request_id.is_none())?,
            },
        };
        queue.remove(index)
    }

    /// Hand `reply` to its waiter. A waiter whose caller has gone away is
    /// skipped and the reply goes to the next match.
    fn deliver(&mut self, topic: &str, mode: CorrelationMode, mut reply: Reply) -> bool {
        while let Some(waiter) = self.take_match(topic, mode, &reply) {
            match waiter.tx.send(reply) {
                Ok(()) => return true,
                Err(returned) => reply = returned,
            }
        }
        false
    }
}

/// Removes a waiter when its `send_and_wait` call finishes or is dropped.
struct WaiterGuard {
    pending: Arc<Mutex<Pending>>,
    topic: String,
    seq: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.topic, self.seq);
    }
}

pub struct Correlator {
    transport: Arc<dyn Transport>,
    mode: CorrelationMode,
    qos: QoS,
    pending: Arc<Mutex<Pending>>,
    subscribed: tokio::sync::Mutex<HashSet<String>>,
    next_seq: AtomicU64,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_mode(transport, CorrelationMode::default())
    }

    pub fn with_mode(transport: Arc<dyn Transport>, mode: CorrelationMode) -> Self {
        Self {
            transport,
            mode,
            qos: QoS::AtLeastOnce,
            pending: Arc::new(Mutex::new(Pending::default())),
            subscribed: tokio::sync::Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Publish `request` on `input_topic` and wait for its reply on
    /// `output_topic`. Dropping the returned future withdraws the wait.
    ///
    /// An error envelope from the agent is returned as
    /// [`MeshError::AgentFailed`].
    pub async fn send_and_wait(
        &self,
        input_topic: &str,
        output_topic: &str,
        request: Payload,
        timeout: Duration,
    ) -> MeshResult<Reply> {
        self.ensure_subscribed(output_topic).await?;

        let (bytes, request_id) = self.encode(request);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.lock().register(
            output_topic,
            Waiter {
                seq,
                request_id: request_id.clone(),
                tx,
            },
        );
        let _guard = WaiterGuard {
            pending: self.pending.clone(),
            topic: output_topic.to_string(),
            seq,
        };

        self.transport.publish(input_topic, bytes, self.qos).await?;
        tracing::debug!(
            "[Correlator] Sent request {} on '{}', waiting on '{}'",
            request_id.as_deref().unwrap_or("(no id)"),
            input_topic,
            output_topic
        );

        let started = Instant::now();
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(MeshError::Connection(
                    "correlator closed while waiting for reply".to_string(),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    "[Correlator] No reply on '{}' after {}ms",
                    output_topic,
                    timeout.as_millis()
                );
                return Err(MeshError::Timeout {
                    topic: output_topic.to_string(),
                    waited_ms: timeout.as_millis(),
                });
            }
        };

        tracing::debug!(
            "[Correlator] Reply on '{}' after {}ms",
            output_topic,
            started.elapsed().as_millis()
        );

        if let Some(error) = ErrorEnvelope::from_reply(&reply) {
            return Err(MeshError::AgentFailed {
                agent: error.error.agent,
                message: error.error.message,
            });
        }
        Ok(reply)
    }

    /// Publish without waiting for a reply.
    pub async fn send(&self, topic: &str, request: Payload) -> MeshResult<Option<String>> {
        let (bytes, request_id) = self.encode(request);
        self.transport.publish(topic, bytes, self.qos).await?;
        Ok(request_id)
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.lock().by_topic.values().map(VecDeque::len).sum()
    }

    /// Drop every subscription and fail all pending waits.
    pub async fn close(&self) {
        let topics: Vec<String> = self.subscribed.lock().await.drain().collect();
        for topic in topics {
            if let Err(e) = self.transport.unsubscribe(&topic).await {
                tracing::debug!("[Correlator] Unsubscribe from '{}' failed: {}", topic, e);
            }
        }
        self.lock().by_topic.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn encode(&self, request: Payload) -> (Vec<u8>, Option<String>) {
        match request {
            Payload::Binary(bytes) => (bytes, None),
            Payload::Json(mut map) => {
                let request_id = match self.mode {
                    CorrelationMode::TopicOnly => request_id_of(&map).map(str::to_string),
                    CorrelationMode::RequestId => {
                        let id = request_id_of(&map)
                            .map(str::to_string)
                            .unwrap_or_else(new_request_id);
                        map.insert(REQUEST_ID_FIELD.to_string(), Value::String(id.clone()));
                        Some(id)
                    }
                };
                (Value::Object(map).to_string().into_bytes(), request_id)
            }
        }
    }

    async fn ensure_subscribed(&self, topic: &str) -> MeshResult<()> {
        let mut subscribed = self.subscribed.lock().await;
        if subscribed.contains(topic) {
            return Ok(());
        }

        let pending = self.pending.clone();
        let mode = self.mode;
        let key = topic.to_string();
        let handler = Arc::new(move |envelope: Envelope| {
            let reply = match envelope.json_object() {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("[Correlator] Ignoring non-JSON reply on '{}': {}", envelope.topic, e);
                    return;
                }
            };
            let request_id = request_id_of(&reply).map(str::to_string);
            let delivered = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .deliver(&key, mode, reply);
            if !delivered {
                tracing::debug!(
                    "[Correlator] Unmatched reply on '{}' (request_id={:?})",
                    envelope.topic,
                    request_id
                );
            }
        });

        self.transport.subscribe(topic, self.qos, handler).await?;
        subscribed.insert(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(v: Value) -> Reply {
        v.as_object().cloned().unwrap()
    }

    fn waiter(seq: u64, id: Option<&str>) -> (Waiter, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Waiter {
                seq,
                request_id: id.map(str::to_string),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_request_id_match_skips_older_waiters() {
        let mut pending = Pending::default();
        let (a, _ra) = waiter(1, Some("a"));
        let (b, _rb) = waiter(2, Some("b"));
        pending.register("out", a);
        pending.register("out", b);

        let w = pending
            .take_match("out", CorrelationMode::RequestId, &reply(json!({"request_id": "b"})))
            .unwrap();
        assert_eq!(w.seq, 2);
        assert!(pending
            .take_match("out", CorrelationMode::RequestId, &reply(json!({"request_id": "zzz"})))
            .is_none());
    }

    #[test]
    fn test_topic_only_takes_oldest() {
        let mut pending = Pending::default();
        let (a, _ra) = waiter(1, Some("a"));
        let (b, _rb) = waiter(2, Some("b"));
        pending.register("out", a);
        pending.register("out", b);

        let w = pending
            .take_match("out", CorrelationMode::TopicOnly, &reply(json!({"request_id": "b"})))
            .unwrap();
        assert_eq!(w.seq, 1);
    }

    #[test]
    fn test_id_less_reply_goes_to_id_less_waiter() {
        let mut pending = Pending::default();
        let (a, _ra) = waiter(1, Some("a"));
        let (b, _rb) = waiter(2, None);
        pending.register("out", a);
        pending.register("out", b);

        let w = pending
            .take_match("out", CorrelationMode::RequestId, &reply(json!({"text": "..."})))
            .unwrap();
        assert_eq!(w.seq, 2);
    }

    #[test]
    fn test_deliver_skips_waiters_whose_caller_is_gone() {
        let mut pending = Pending::default();
        let (gone, rx_gone) = waiter(1, None);
        let (alive, mut rx_alive) = waiter(2, None);
        pending.register("out", gone);
        pending.register("out", alive);
        drop(rx_gone);

        assert!(pending.deliver("out", CorrelationMode::TopicOnly, reply(json!({"n": 1}))));
        assert_eq!(rx_alive.try_recv().unwrap()["n"], 1);
        assert!(!pending.deliver("out", CorrelationMode::TopicOnly, reply(json!({"n": 2}))));
    }

    #[test]
    fn test_waiter_guard_removes_on_drop() {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (w, _rx) = waiter(7, Some("a"));
        pending.lock().unwrap().register("out", w);
        drop(WaiterGuard {
            pending: pending.clone(),
            topic: "out".to_string(),
            seq: 7,
        });
        assert!(pending.lock().unwrap().by_topic["out"].is_empty());
    }
}
