//! [`Bus`] over an MQTT broker using `rumqttc`.
//!
//! # Design
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] handle and an
//! [`EventLoop`] that must be polled for anything to happen. [`MqttBus`]
//! spawns one task that polls the event loop for the life of the bus:
//!
//! - incoming `PUBLISH` packets are forwarded to the inbound channel
//! - `CONNACK` marks the connection up and, when the broker kept no
//!   session, re-issues every subscription made so far
//! - a poll error marks the connection down; the next poll reconnects
//!
//! Connection state lives in a `watch` channel so that [`Bus::reconnect`]
//! can wait for the event loop to bring the link back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Bus, BusMessage};
use crate::config::MqttConfig;
use crate::error::BusError;

/// Upper bounds on how long each bus operation may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTimeouts {
    /// Waiting for the connection plus enqueuing a subscription.
    pub subscribe: Duration,
    /// Enqueuing one publish.
    pub publish: Duration,
    /// Waiting for the connection to come back.
    pub reconnect: Duration,
}

impl Default for BusTimeouts {
    fn default() -> Self {
        Self {
            subscribe: Duration::from_secs(10),
            publish: Duration::from_secs(5),
            reconnect: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    topics: Mutex<BTreeSet<String>>,
    connected: watch::Sender<bool>,
}

/// MQTT connection shared by the ingestion manager and command publishing.
#[derive(Debug)]
pub struct MqttBus {
    client: AsyncClient,
    state: Arc<ConnectionState>,
    timeouts: BusTimeouts,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Creates the client and spawns its event loop.
    ///
    /// Must be called from within a Tokio runtime. The connection is made
    /// lazily by the event loop; operations wait for it up to their timeout.
    pub fn connect(config: &MqttConfig, timeouts: BusTimeouts) -> (Self, mpsc::Receiver<BusMessage>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity);
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (connected, _) = watch::channel(false);
        let state = Arc::new(ConnectionState {
            topics: Mutex::new(BTreeSet::new()),
            connected,
        });

        let handle = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&state),
            tx,
            Duration::from_millis(config.reconnect_delay_ms),
        ));

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "mqtt client started"
        );

        let bus = Self {
            client,
            state,
            timeouts,
            event_loop: handle,
        };
        (bus, rx)
    }

    /// Returns `true` while the broker connection is up.
    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    /// Sends `DISCONNECT` and stops the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "disconnect request not delivered");
        }
        self.event_loop.abort();
    }

    async fn wait_connected(&self, operation: &'static str, timeout: Duration) -> Result<(), BusError> {
        let mut rx = self.state.connected.subscribe();
        let wait = async move { rx.wait_for(|connected| *connected).await.map(|_| ()) };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout { operation, timeout }),
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        let timeout = self.timeouts.subscribe;
        let request = async {
            self.wait_connected("subscribe", timeout).await?;
            self.client
                .subscribe(topic, QoS::AtMostOnce)
                .await
                .map_err(|e| BusError::Client(e.to_string()))
        };
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(())) => {
                self.state.topics.lock().insert(topic.to_string());
                tracing::debug!(topic, "subscribed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Timeout {
                operation: "subscribe",
                timeout,
            }),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let timeout = self.timeouts.publish;
        match tokio::time::timeout(
            timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::Client(e.to_string())),
            Err(_) => Err(BusError::Timeout {
                operation: "publish",
                timeout,
            }),
        }
    }

    async fn reconnect(&self) -> Result<(), BusError> {
        self.wait_connected("reconnect", self.timeouts.reconnect).await
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    state: Arc<ConnectionState>,
    inbound: mpsc::Sender<BusMessage>,
    retry_delay: Duration,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                tracing::info!(session_present = ack.session_present, "connected to broker");
                state.connected.send_replace(true);
                if !ack.session_present {
                    resubscribe(&client, &state);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = BusMessage::new(publish.topic, publish.payload.to_vec());
                if inbound.send(message).await.is_err() {
                    tracing::debug!("inbound receiver dropped, stopping mqtt event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.connected.send_replace(false);
                tracing::info!("disconnected from broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.connected.send_replace(false) {
                    tracing::warn!(error = %e, "broker connection lost");
                } else {
                    tracing::debug!(error = %e, "broker still unreachable");
                }
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Re-issues every known subscription on a fresh session.
fn resubscribe(client: &AsyncClient, state: &ConnectionState) {
    let topics: Vec<String> = state.topics.lock().iter().cloned().collect();
    for topic in topics {
        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            tracing::warn!(topic = %topic, error = %e, "failed to restore subscription");
        }
    }
}
