//! MQTT transport backed by `rumqttc`.
//!
//! Lifecycle:
//!   1. `connect(config, client_id)` — open the socket and wait for CONNACK
//!      (bounded by `connect_timeout`); failure is a `Connection` error.
//!   2. A background task drives the event loop and dispatches every inbound
//!      PUBLISH through the [`TopicRouter`].
//!   3. After the initial connect, network errors are retried with
//!      exponential backoff; if the broker lost our session, every routed
//!      filter is subscribed again.
//!   4. `disconnect()` — send DISCONNECT and join the event-loop task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::task::JoinHandle;

use super::router::{MessageHandler, TopicRouter};
use super::Transport;
use crate::config::BrokerConfig;
use crate::error::{MeshError, MeshResult};
use crate::message::{Envelope, QoS};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DISCONNECT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    client: AsyncClient,
    client_id: String,
    router: TopicRouter,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker and start the background dispatch loop.
    pub async fn connect(config: &BrokerConfig, client_id: &str) -> MeshResult<Self> {
        tracing::info!(
            "[Mqtt] Connecting '{}' to {}:{}",
            client_id,
            config.host,
            config.port
        );

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_max_packet_size(config.max_packet_bytes, config.max_packet_bytes);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(config.connect_timeout(), handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(MeshError::Connection(format!(
                    "broker {}:{} unreachable: {}",
                    config.host, config.port, e
                )));
            }
            Err(_) => {
                return Err(MeshError::Connection(format!(
                    "no CONNACK from {}:{} within {}s",
                    config.host, config.port, config.connect_timeout_secs
                )));
            }
        }

        tracing::info!("[Mqtt] '{}' connected", client_id);

        let router = TopicRouter::new();
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            router.clone(),
            connected.clone(),
            closing.clone(),
            client_id.to_string(),
        ));

        Ok(Self {
            client,
            client_id: client_id.to_string(),
            router,
            connected,
            closing,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    router: TopicRouter,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    name: String,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let envelope = Envelope::new(publish.topic.clone(), publish.payload.to_vec());
                router.dispatch(envelope);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected.store(true, Ordering::SeqCst);
                backoff = INITIAL_BACKOFF;
                tracing::info!("[Mqtt] '{}' reconnected (session_present={})", name, ack.session_present);
                if !ack.session_present {
                    resubscribe(&client, &router, &name);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("[Mqtt] '{}' sent DISCONNECT", name);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                connected.store(false, Ordering::SeqCst);
                tracing::warn!(
                    "[Mqtt] '{}' connection error: {} (retrying in {}ms)",
                    name,
                    e,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    tracing::debug!("[Mqtt] '{}' event loop stopped", name);
}

fn resubscribe(client: &AsyncClient, router: &TopicRouter, name: &str) {
    // try_subscribe: awaiting here would block the loop that drains the request channel.
    for (filter, qos) in router.filters() {
        if let Err(e) = client.try_subscribe(filter.clone(), qos.into()) {
            tracing::warn!("[Mqtt] '{}' failed to resubscribe '{}': {}", name, filter, e);
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> MeshResult<()> {
        self.router.insert(filter, qos, handler);
        if let Err(e) = self.client.subscribe(filter, qos.into()).await {
            self.router.remove(filter);
            return Err(e.into());
        }
        tracing::debug!("[Mqtt] '{}' subscribed to '{}'", self.client_id, filter);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> MeshResult<()> {
        self.router.remove(filter);
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> MeshResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MeshError::Connection(format!(
                "'{}' is disconnected",
                self.client_id
            )));
        }
        self.client.publish(topic, qos.into(), false, payload).await?;
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("[Mqtt] Disconnecting '{}'", self.client_id);

        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("[Mqtt] '{}' disconnect request failed: {}", self.client_id, e);
        }

        let handle = self.event_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(DISCONNECT_JOIN_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }
}
