//! In-process broker with the same delivery shape as the MQTT one:
//! per-connection dispatch task, in-order delivery per publisher and topic,
//! wildcard filters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::router::{topic_matches, MessageHandler, TopicRouter};
use super::Transport;
use crate::error::{MeshError, MeshResult};
use crate::message::{Envelope, QoS};

struct ClientSlot {
    client_id: String,
    filters: Vec<String>,
    inbox: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: u64,
    clients: HashMap<u64, ClientSlot>,
}

/// Shared in-memory broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection. Must be called inside a tokio runtime since
    /// the connection's dispatch task is spawned here.
    pub fn connect(&self, client_id: &str) -> MemoryTransport {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.clients.insert(
                id,
                ClientSlot {
                    client_id: client_id.to_string(),
                    filters: Vec::new(),
                    inbox: tx,
                },
            );
            id
        };

        let router = TopicRouter::new();
        let dispatch_router = router.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                dispatch_router.dispatch(envelope);
            }
        });

        tracing::debug!("[MemoryBroker] Client '{}' connected (id={})", client_id, id);

        MemoryTransport {
            id,
            client_id: client_id.to_string(),
            broker: self.clone(),
            router,
            connected: Arc::new(AtomicBool::new(true)),
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    /// Number of live connections.
    pub fn client_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clients.len()
    }

    /// Deliver to every connection with at least one matching filter.
    /// Returns how many connections received the message.
    fn route(&self, envelope: &Envelope) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for slot in inner.clients.values() {
            if slot.filters.iter().any(|f| topic_matches(f, &envelope.topic))
                && slot.inbox.send(envelope.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn add_filter(&self, id: u64, filter: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.clients.get_mut(&id) {
            if !slot.filters.iter().any(|f| f == filter) {
                slot.filters.push(filter.to_string());
            }
        }
    }

    fn remove_filter(&self, id: u64, filter: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.clients.get_mut(&id) {
            slot.filters.retain(|f| f != filter);
        }
    }

    fn drop_client(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.clients.remove(&id) {
            tracing::debug!("[MemoryBroker] Client '{}' disconnected", slot.client_id);
        }
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    id: u64,
    client_id: String,
    broker: MemoryBroker,
    router: TopicRouter,
    connected: Arc<AtomicBool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn ensure_connected(&self) -> MeshResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MeshError::Connection(format!(
                "memory client '{}' is disconnected",
                self.client_id
            )))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> MeshResult<()> {
        self.ensure_connected()?;
        self.router.insert(filter, qos, handler);
        self.broker.add_filter(self.id, filter);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> MeshResult<()> {
        self.router.remove(filter);
        self.broker.remove_filter(self.id, filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> MeshResult<()> {
        self.ensure_connected()?;
        let delivered = self.broker.route(&Envelope::new(topic, payload));
        tracing::trace!(
            "[MemoryBroker] '{}' published to '{}' ({} subscriber(s))",
            self.client_id,
            topic,
            delivered
        );
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.drop_client(self.id);
        let handle = self.dispatch.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.drop_client(self.id);
        }
        if let Some(handle) = self.dispatch.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
