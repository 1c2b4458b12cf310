//! Bus ingestion: turns broker messages into stored records and rollups.
//!
//! # Design
//!
//! The [`IngestionManager`] owns the wiring between the bus, the store, the
//! rollup engine and the notifier. It is cheap to clone; every clone shares
//! the same subscription table.
//!
//! - **Startup** restores a subscription for every known device, then
//!   subscribes to `discovery` and `events`. A device announced during
//!   startup therefore cannot race its own restore.
//! - **Dispatch** runs every inbound message on its own task. Store and
//!   rollup work is synchronous and moves to the blocking pool.
//! - **Failure policy**: malformed payloads and store errors are logged and
//!   the message is dropped. A failed subscription is fatal and stops
//!   [`run`](IngestionManager::run), since continuing would silently lose a
//!   device's data.
//!
//! # Message Flow
//!
//! ```text
//! discovery ─► upsert device ─► subscribe <device> (once)
//! events    ─► append event  ─► notify
//! <device>  ─► append values ─► recompute hour/day/week/month
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};

use crate::bus::{call_topic, is_reserved_topic, Bus, BusMessage, DISCOVERY_TOPIC, EVENTS_TOPIC};
use crate::config::PublishConfig;
use crate::error::{BusError, HearthError, IngestError, PublishError, StoreError};
use crate::model::{Command, Device, Event, Value};
use crate::notify::{EventNotice, Notice, Notifier};
use crate::rollup::RollupEngine;
use crate::store::TelemetryStore;

/// Subscription status of one device topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Never subscribed.
    Unsubscribed,
    /// Subscription acknowledged.
    Subscribed,
    /// The last attempt failed.
    SubscribeFailed,
}

/// Which device topics this process listens on.
///
/// States live behind a short-lived lock that is never held across an
/// await, so checking a device never waits on another device's subscribe.
/// Subscribing goes through a per-device async guard held for the whole
/// subscribe call: concurrent discovery messages for one device result in
/// exactly one subscription, while other devices proceed independently.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    states: parking_lot::Mutex<HashMap<String, SubscriptionState>>,
    guards: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubscriptionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `device_id`.
    pub fn state(&self, device_id: &str) -> SubscriptionState {
        self.states
            .lock()
            .get(device_id)
            .copied()
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Returns `true` if `device_id` is subscribed.
    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.state(device_id) == SubscriptionState::Subscribed
    }

    /// Number of subscribed devices.
    pub fn subscribed_count(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|s| **s == SubscriptionState::Subscribed)
            .count()
    }

    /// Subscribes to `device_id` unless already subscribed.
    ///
    /// Returns `true` if a new subscription was made.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the subscription fails; the device is then
    /// recorded as [`SubscriptionState::SubscribeFailed`].
    pub async fn ensure_subscribed(&self, bus: &dyn Bus, device_id: &str) -> Result<bool, BusError> {
        if self.is_subscribed(device_id) {
            return Ok(false);
        }
        let guard = Arc::clone(
            self.guards
                .lock()
                .entry(device_id.to_string())
                .or_default(),
        );
        let _held = guard.lock().await;
        // Another task may have finished while this one waited.
        if self.is_subscribed(device_id) {
            return Ok(false);
        }

        let outcome = bus.subscribe(device_id).await;
        let state = if outcome.is_ok() {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::SubscribeFailed
        };
        self.states.lock().insert(device_id.to_string(), state);
        outcome.map(|()| true)
    }
}

/// A device topic carries either a batch of samples or a single sample.
#[derive(Deserialize)]
#[serde(untagged)]
enum Samples {
    Batch(Vec<Value>),
    Single(Value),
}

impl Samples {
    fn into_vec(self) -> Vec<Value> {
        match self {
            Self::Batch(values) => values,
            Self::Single(value) => vec![value],
        }
    }
}

/// Routes bus messages into the store.
#[derive(Clone)]
pub struct IngestionManager {
    store: Arc<TelemetryStore>,
    rollup: RollupEngine,
    bus: Arc<dyn Bus>,
    subscriptions: Arc<SubscriptionTable>,
    notifier: Notifier,
    publish: PublishConfig,
}

impl IngestionManager {
    /// Wires a manager together.
    pub fn new(
        store: Arc<TelemetryStore>,
        rollup: RollupEngine,
        bus: Arc<dyn Bus>,
        notifier: Notifier,
        publish: PublishConfig,
    ) -> Self {
        Self {
            store,
            rollup,
            bus,
            subscriptions: Arc::new(SubscriptionTable::new()),
            notifier,
            publish,
        }
    }

    /// The subscription table shared by every clone.
    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Restores device subscriptions, then subscribes to the fixed topics.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] if the device list cannot be read or any
    /// subscription fails.
    pub async fn start(&self) -> Result<(), IngestError> {
        let restored = self.restore_subscriptions().await?;
        for topic in [DISCOVERY_TOPIC, EVENTS_TOPIC] {
            self.bus
                .subscribe(topic)
                .await
                .map_err(|source| IngestError::Subscribe {
                    topic: topic.to_string(),
                    source,
                })?;
        }
        tracing::info!(devices = restored, "ingestion started");
        Ok(())
    }

    /// Subscribes to the topic of every stored device. Returns how many
    /// devices are subscribed afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Restore`] if the device list cannot be read
    /// and [`IngestError::Subscribe`] on the first failed subscription.
    pub async fn restore_subscriptions(&self) -> Result<usize, IngestError> {
        let devices = self
            .blocking(|store| store.list_devices())
            .await
            .map_err(|e| IngestError::Restore(into_store_error(e)))?;

        for device in &devices {
            if is_reserved_topic(&device.id) {
                tracing::warn!(device = %device.id, "stored device id collides with a fixed topic, skipping");
                continue;
            }
            self.subscribe_device(&device.id).await?;
        }
        Ok(self.subscriptions.subscribed_count())
    }

    /// Consumes inbound messages until the stream ends.
    ///
    /// Each message is handled on its own task. Returns `Ok(())` once the
    /// stream is closed and every in-flight message has been handled.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`IngestError`] raised by a handler.
    pub async fn run(&self, mut inbound: mpsc::Receiver<BusMessage>) -> Result<(), IngestError> {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        let this = self.clone();
                        tasks.spawn(async move { this.dispatch(message).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => check_task(joined)?,
            }
        }
        while let Some(joined) = tasks.join_next().await {
            check_task(joined)?;
        }
        tracing::info!("inbound stream closed, ingestion stopped");
        Ok(())
    }

    /// Handles one message according to its topic.
    ///
    /// Messages on a device topic that is not subscribed are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Subscribe`] if discovery triggers a failed
    /// subscription. All other problems are logged and swallowed.
    pub async fn dispatch(&self, message: BusMessage) -> Result<(), IngestError> {
        self.notifier.activity(&message.topic, &message.payload);
        match message.topic.as_str() {
            DISCOVERY_TOPIC => self.handle_discovery(&message.payload).await,
            EVENTS_TOPIC => {
                self.handle_event(&message.payload).await;
                Ok(())
            }
            topic => {
                if self.subscriptions.is_subscribed(topic) {
                    self.handle_values(topic, &message.payload).await;
                } else {
                    tracing::debug!(topic, "message on unsubscribed topic ignored");
                }
                Ok(())
            }
        }
    }

    /// Records a device descriptor and makes sure its topic is subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Subscribe`] if the subscription fails.
    pub async fn handle_discovery(&self, payload: &[u8]) -> Result<(), IngestError> {
        let device: Device = match serde_json::from_slice(payload) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(error = %e, "malformed discovery payload dropped");
                return Ok(());
            }
        };
        if device.id.is_empty() || is_reserved_topic(&device.id) {
            tracing::warn!(device = %device.id, "discovery with unusable device id dropped");
            return Ok(());
        }

        let id = device.id.clone();
        if let Err(e) = self.blocking(move |store| store.upsert_device(&device)).await {
            tracing::error!(device = %id, error = %e, "failed to store device");
            return Ok(());
        }
        tracing::debug!(device = %id, "device discovered");
        self.subscribe_device(&id).await
    }

    /// Stores an event and queues a notice for it. Returns the effective
    /// event time, or `None` if the message was dropped.
    pub async fn handle_event(&self, payload: &[u8]) -> Option<DateTime<Utc>> {
        let event: Event = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "malformed event payload dropped");
                return None;
            }
        };

        let stored = event.clone();
        let time = match self
            .blocking(move |store| {
                let id = stored.id.clone();
                store.append_event(&id, stored)
            })
            .await
        {
            Ok(time) => time,
            Err(e) => {
                tracing::error!(source = %event.id, error = %e, "failed to store event");
                return None;
            }
        };

        if let Some(notice) = EventNotice::from_event(&event, time) {
            self.notifier.notify(Notice::Event(notice));
        }
        Some(time)
    }

    /// Stores a batch of samples from `device_id` and updates their
    /// rollups. Returns how many samples were stored.
    pub async fn handle_values(&self, device_id: &str, payload: &[u8]) -> usize {
        let values = match serde_json::from_slice::<Samples>(payload) {
            Ok(samples) => samples.into_vec(),
            Err(e) => {
                tracing::warn!(device = device_id, error = %e, "malformed values payload dropped");
                return 0;
            }
        };
        if values.is_empty() {
            return 0;
        }

        let rollup = self.rollup.clone();
        let device = device_id.to_string();
        let result = self
            .blocking(move |store| Ok(ingest_values(store, &rollup, &device, values)))
            .await;
        match result {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(device = device_id, error = %e, "values task failed");
                0
            }
        }
    }

    /// Publishes `command` on the device's call topic, retrying with a
    /// reconnect between attempts. Returns the attempt that succeeded.
    ///
    /// If the device is known and declares methods, the command's method
    /// must be one of them.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::UnknownMethod`] for an undeclared method and
    /// [`PublishError::Exhausted`] once every attempt has failed.
    pub async fn call(&self, device_id: &str, command: &Command) -> Result<u32, PublishError> {
        let lookup = device_id.to_string();
        match self.blocking(move |store| store.get_device(&lookup)).await {
            Ok(Some(device)) if !device.methods.is_empty() && !device.declares_method(&command.method) => {
                return Err(PublishError::UnknownMethod {
                    device: device_id.to_string(),
                    method: command.method.clone(),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(device = device_id, error = %e, "could not check declared methods"),
        }

        let payload = serde_json::to_vec(command)?;
        publish_with_retry(self.bus.as_ref(), &call_topic(device_id), payload, &self.publish).await
    }

    async fn subscribe_device(&self, device_id: &str) -> Result<(), IngestError> {
        match self
            .subscriptions
            .ensure_subscribed(self.bus.as_ref(), device_id)
            .await
        {
            Ok(true) => {
                tracing::info!(device = device_id, "subscribed to device");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(source) => {
                tracing::error!(device = device_id, error = %source, "device subscription failed");
                Err(IngestError::Subscribe {
                    topic: device_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Runs synchronous store work on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TelemetryStore) -> crate::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| StoreError::TaskFailed {
                reason: e.to_string(),
            })?
    }
}

/// Publishes with up to `policy.max_attempts` attempts, each bounded by
/// `policy.attempt_timeout()`, reconnecting between attempts. Returns the
/// attempt that succeeded.
///
/// # Errors
///
/// Returns [`PublishError::Exhausted`] carrying the last transport error once
/// every attempt has failed.
pub async fn publish_with_retry(
    bus: &dyn Bus,
    topic: &str,
    payload: Vec<u8>,
    policy: &PublishConfig,
) -> Result<u32, PublishError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = BusError::Disconnected;

    for attempt in 1..=attempts {
        let timeout = policy.attempt_timeout();
        match tokio::time::timeout(timeout, bus.publish(topic, payload.clone())).await {
            Ok(Ok(())) => {
                tracing::debug!(topic, attempt, "published");
                return Ok(attempt);
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = BusError::Timeout {
                    operation: "publish",
                    timeout,
                }
            }
        }
        tracing::warn!(topic, attempt, max_attempts = attempts, error = %last_error, "publish attempt failed");

        if attempt < attempts {
            let reconnect = tokio::time::timeout(policy.reconnect_timeout(), bus.reconnect()).await;
            match reconnect {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(topic, error = %e, "reconnect failed"),
                Err(_) => tracing::warn!(topic, "reconnect timed out"),
            }
        }
    }

    Err(PublishError::Exhausted {
        topic: topic.to_string(),
        attempts,
        last: last_error,
    })
}

/// Appends each sample and recomputes its rollups. A failing sample is
/// logged and skipped; the rest of the batch still lands.
fn ingest_values(
    store: &TelemetryStore,
    rollup: &RollupEngine,
    device_id: &str,
    values: Vec<Value>,
) -> usize {
    let mut stored = 0;
    for value in values {
        let sensor_id = value.id.clone();
        let sensor_type = rollup.sensor_type(device_id, &value).unwrap_or_else(|e| {
            tracing::warn!(device = device_id, sensor = %sensor_id, error = %e, "sensor type lookup failed");
            String::new()
        });

        let time = match store.append_value(device_id, value) {
            Ok(time) => time,
            Err(e) => {
                tracing::error!(device = device_id, sensor = %sensor_id, error = %e, "failed to store value");
                continue;
            }
        };
        stored += 1;

        if let Err(e) = rollup.recompute(device_id, &sensor_id, &sensor_type, time) {
            tracing::error!(device = device_id, sensor = %sensor_id, error = %e, "rollup failed");
        }
    }
    tracing::trace!(device = device_id, stored, "values ingested");
    stored
}

fn check_task(joined: Result<Result<(), IngestError>, JoinError>) -> Result<(), IngestError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            tracing::error!(error = %e, "message handler panicked");
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn into_store_error(error: HearthError) -> StoreError {
    match error {
        HearthError::Store(e) => e,
        other => StoreError::TaskFailed {
            reason: other.to_string(),
        },
    }
}
