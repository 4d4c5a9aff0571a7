//! agentmesh core — agent orchestration over a pub/sub broker.
//!
//! Independent agent workers (chat, PDF parsing, sheet column selection,
//! network training) each bind one input topic to one output topic. An
//! orchestrator picks a named workflow, launches that workflow's agents as
//! separate processes and talks to them through a request/response
//! correlator:
//!
//! ```text
//! caller ─► Correlator ─► broker ─► AgentWorker ─► Transform
//!    ▲                                   │
//!    └──────── broker ◄──── publish ◄────┘
//! ```
//!
//! The crate has no UI and no broker of its own; [`transport::MemoryBroker`]
//! exists for tests and single-process demos.

pub mod config;
pub mod correlator;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;
pub mod worker;

// Convenience re-exports
pub use config::{BrokerConfig, OrchestratorConfig};
pub use correlator::{CorrelationMode, Correlator};
pub use error::{MeshError, MeshResult, TransformError};
pub use lifecycle::{LifecycleManager, ProcessLauncher, ShellLauncher};
pub use message::{Envelope, Payload, PayloadKind, QoS};
pub use registry::Registry;
pub use session::Session;
pub use transport::{MemoryBroker, MqttTransport, Transport};
pub use worker::{AgentKind, AgentWorker, TopicBinding, Transform, WorkerOptions, WorkerState};
