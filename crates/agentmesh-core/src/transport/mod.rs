//! Broker transport — the pub/sub connection every agent and caller uses.
//!
//! ```text
//!   caller ──publish──► Transport ──► broker ──► Transport ──► TopicRouter
//!                                                               │
//!                                            handler(topic A) ◄─┤
//!                                            handler(topic B) ◄─┘
//! ```
//!
//! Two implementations share the [`Transport`] trait:
//! - [`MqttTransport`] talks to an external MQTT broker (QoS 1).
//! - [`MemoryBroker`] / [`MemoryTransport`] route messages in-process, for
//!   tests and single-binary demos.
//!
//! Inbound messages are always dispatched on a background task owned by the
//! transport, never on the task that called `publish`.

pub mod memory;
pub mod mqtt;
pub mod router;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;
pub use router::{topic_matches, MessageHandler, TopicRouter};

use async_trait::async_trait;

use crate::error::MeshResult;
use crate::message::QoS;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Register interest in `filter` and route matching messages to `handler`.
    /// Subscribing again to the same filter replaces its handler.
    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> MeshResult<()>;

    async fn unsubscribe(&self, filter: &str) -> MeshResult<()>;

    /// Fire-and-forget publish. Success means the broker accepted the
    /// message, not that anyone processed it.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> MeshResult<()>;

    /// Stop the dispatch loop and close the connection. Idempotent.
    async fn disconnect(&self) -> MeshResult<()>;

    fn is_connected(&self) -> bool;
}
