//! Agent worker runtime.
//!
//! A worker binds one input topic to one output topic and applies a
//! [`Transform`] to every message in between:
//!
//! ```text
//!   input_topic ─► Transport dispatch ─► mpsc ─► processing task ─► Transform
//!                                                        │
//!   output_topic ◄──────────── publish (exactly one) ◄───┘
//! ```
//!
//! The transport's dispatch task only forwards envelopes into a channel; a
//! single processing task drains it, so one message is processed to
//! completion before the next one starts.
//!
//! State machine:
//! `Disconnected → Connecting → Subscribed → (Idle ⇄ Processing) → Stopped`

pub mod chat;
pub mod pdf;
pub mod sheet;
pub mod train;

pub use chat::ChatTransform;
pub use pdf::PdfTransform;
pub use sheet::SheetTransform;
pub use train::TrainTransform;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{MeshError, MeshResult, TransformError};
use crate::message::{Envelope, ErrorEnvelope, Payload, PayloadKind, QoS, REQUEST_ID_FIELD};
use crate::transport::Transport;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Domain logic applied by a worker to each inbound payload.
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    /// Short agent name used in logs and error envelopes.
    fn name(&self) -> &str;

    /// How inbound payloads must be decoded before [`Transform::apply`].
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Json
    }

    /// Produce the reply for one request. Return
    /// [`TransformError::InvalidInput`] for malformed requests (dropped
    /// silently) and [`TransformError::Failed`] for domain faults.
    async fn apply(&self, payload: Payload) -> Result<Value, TransformError>;
}

/// The built-in agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Chat,
    Pdf,
    Sheet,
    Train,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [AgentKind::Chat, AgentKind::Pdf, AgentKind::Sheet, AgentKind::Train];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Chat => "chat",
            AgentKind::Pdf => "pdf",
            AgentKind::Sheet => "sheet",
            AgentKind::Train => "train",
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            AgentKind::Pdf => PayloadKind::Binary,
            _ => PayloadKind::Json,
        }
    }

    /// Conventional `<user_id>/<domain>/<direction>` topics used when a
    /// worker is started without explicit topics.
    pub fn default_binding(&self, user_id: u32) -> TopicBinding {
        let (domain, input, output) = match self {
            AgentKind::Chat => ("chatbot", "input_data", "output_data"),
            AgentKind::Pdf => ("pdf", "encoded", "prompt_data"),
            AgentKind::Sheet => ("sheet", "encoded", "selected_data"),
            AgentKind::Train => ("nn", "train_data", "output_data"),
        };
        TopicBinding::new(
            format!("{}/{}/{}", user_id, domain, input),
            format!("{}/{}/{}", user_id, domain, output),
        )
    }

    /// Build the stock transform for this kind.
    pub fn transform(&self) -> Arc<dyn Transform> {
        match self {
            AgentKind::Chat => Arc::new(ChatTransform::from_env()),
            AgentKind::Pdf => Arc::new(PdfTransform),
            AgentKind::Sheet => Arc::new(SheetTransform),
            AgentKind::Train => Arc::new(TrainTransform::default()),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" | "chatbot" => Ok(AgentKind::Chat),
            "pdf" | "pdf_parse" => Ok(AgentKind::Pdf),
            "sheet" | "sheet_parse" => Ok(AgentKind::Sheet),
            "train" | "nn" | "nn_train" => Ok(AgentKind::Train),
            other => Err(MeshError::Configuration(format!("unknown agent kind '{}'", other))),
        }
    }
}

/// One input topic paired with one output topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicBinding {
    pub input_topic: String,
    pub output_topic: String,
}

impl TopicBinding {
    pub fn new(input_topic: impl Into<String>, output_topic: impl Into<String>) -> Self {
        Self {
            input_topic: input_topic.into(),
            output_topic: output_topic.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub qos: QoS,
    /// Publish an [`ErrorEnvelope`] when the transform fails.
    pub publish_errors: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            publish_errors: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Subscribed,
    Idle,
    Processing,
    Stopped,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Replied,
    ErrorReplied,
    Dropped,
}

pub struct AgentWorker {
    name: String,
    transport: Arc<dyn Transport>,
    transform: Arc<dyn Transform>,
    binding: TopicBinding,
    options: WorkerOptions,
    state: watch::Sender<WorkerState>,
    started: AtomicBool,
    stopped: AtomicBool,
    processed: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentWorker {
    /// Create a worker over an already-connected transport. Nothing is
    /// subscribed until [`AgentWorker::start`].
    pub fn new(
        transport: Arc<dyn Transport>,
        transform: Arc<dyn Transform>,
        binding: TopicBinding,
        options: WorkerOptions,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            name: transform.name().to_string(),
            transport,
            transform,
            binding,
            options,
            state,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            processed: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> &TopicBinding {
        &self.binding
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Messages taken off the input topic so far, including dropped ones.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Subscribe to the input topic and start the processing task.
    pub async fn start(&self) -> MeshResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MeshError::Lifecycle(format!("worker '{}' is stopped", self.name)));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.state.send_replace(WorkerState::Connecting);
        if !self.transport.is_connected() {
            self.state.send_replace(WorkerState::Disconnected);
            self.started.store(false, Ordering::SeqCst);
            return Err(MeshError::Connection(format!(
                "worker '{}' has no broker connection",
                self.name
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let forward = Arc::new(move |envelope: Envelope| {
            let _ = tx.send(envelope);
        });
        if let Err(e) = self
            .transport
            .subscribe(&self.binding.input_topic, self.options.qos, forward)
            .await
        {
            self.state.send_replace(WorkerState::Disconnected);
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.state.send_replace(WorkerState::Subscribed);

        tracing::info!(
            "[Worker:{}] Listening on '{}' → '{}'",
            self.name,
            self.binding.input_topic,
            self.binding.output_topic
        );

        let processor = Processor {
            name: self.name.clone(),
            transport: self.transport.clone(),
            transform: self.transform.clone(),
            output_topic: self.binding.output_topic.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            processed: self.processed.clone(),
        };
        self.state.send_replace(WorkerState::Idle);
        let handle = tokio::spawn(processor.run(rx));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Halt dispatch and disconnect. Idempotent; callable from any task.
    ///
    /// A message already being processed is allowed to finish for a short
    /// grace period before the processing task is aborted.
    pub async fn stop(&self) -> MeshResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("[Worker:{}] Stopping", self.name);

        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.transport.unsubscribe(&self.binding.input_topic).await {
                tracing::debug!("[Worker:{}] Unsubscribe failed: {}", self.name, e);
            }
        }

        // Unsubscribing drops the router's sender, which closes the channel.
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("[Worker:{}] In-flight message abandoned on stop", self.name);
                abort.abort();
            }
        }

        let result = self.transport.disconnect().await;
        self.state.send_replace(WorkerState::Stopped);
        result
    }

    /// Block until [`AgentWorker::stop`] has completed.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == WorkerState::Stopped).await;
    }
}

struct Processor {
    name: String,
    transport: Arc<dyn Transport>,
    transform: Arc<dyn Transform>,
    output_topic: String,
    options: WorkerOptions,
    state: watch::Sender<WorkerState>,
    processed: Arc<AtomicU64>,
}

impl Processor {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            self.state.send_replace(WorkerState::Processing);
            let outcome = self.handle(envelope).await;
            self.processed.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("[Worker:{}] Message outcome: {:?}", self.name, outcome);
            self.state.send_if_modified(|s| {
                if *s == WorkerState::Processing {
                    *s = WorkerState::Idle;
                    true
                } else {
                    false
                }
            });
        }
        tracing::debug!("[Worker:{}] Processing loop ended", self.name);
    }

    async fn handle(&self, envelope: Envelope) -> Outcome {
        let payload = match self.transform.payload_kind() {
            PayloadKind::Binary => Payload::Binary(envelope.payload),
            PayloadKind::Json => match envelope.json_object() {
                Ok(map) => Payload::Json(map),
                Err(e) => {
                    tracing::warn!(
                        "[Worker:{}] Dropping non-JSON message on '{}': {}",
                        self.name,
                        envelope.topic,
                        e
                    );
                    return Outcome::Dropped;
                }
            },
        };
        let request_id = payload.request_id().map(str::to_string);

        // Run the transform on its own task so a panic is contained.
        let transform = self.transform.clone();
        let result = match tokio::spawn(async move { transform.apply(payload).await }).await {
            Ok(result) => result,
            Err(join) => Err(TransformError::failed(format!("transform panicked: {}", join))),
        };

        match result {
            Ok(mut reply) => {
                if let (Some(id), Value::Object(map)) = (&request_id, &mut reply) {
                    map.insert(REQUEST_ID_FIELD.to_string(), Value::String(id.clone()));
                }
                self.publish(&reply).await;
                Outcome::Replied
            }
            Err(TransformError::InvalidInput(reason)) => {
                tracing::warn!("[Worker:{}] Dropping malformed request: {}", self.name, reason);
                Outcome::Dropped
            }
            Err(TransformError::Failed(reason)) => {
                tracing::error!("[Worker:{}] Transform failed: {}", self.name, reason);
                if !self.options.publish_errors {
                    return Outcome::Dropped;
                }
                let envelope = ErrorEnvelope::new(&self.name, reason, request_id);
                self.publish(&envelope.to_value()).await;
                Outcome::ErrorReplied
            }
        }
    }

    async fn publish(&self, reply: &Value) {
        let bytes = reply.to_string().into_bytes();
        let size = bytes.len();
        match self.transport.publish(&self.output_topic, bytes, self.options.qos).await {
            Ok(()) => tracing::info!(
                "[Worker:{}] Published {} bytes to '{}'",
                self.name,
                size,
                self.output_topic
            ),
            Err(e) => tracing::error!(
                "[Worker:{}] Failed to publish to '{}': {}",
                self.name,
                self.output_topic,
                e
            ),
        }
    }
}
