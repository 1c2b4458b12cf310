//! In-process bus for tests and local wiring.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Bus, BusMessage};
use crate::error::BusError;

/// A [`Bus`] that keeps everything in memory.
///
/// Messages injected with [`inject`](Self::inject) are delivered to the
/// receiver returned by [`new`](Self::new) only when their topic has been
/// subscribed, like a broker would. Publishes are recorded instead of sent.
/// Failures can be scripted per operation.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusState>,
}

#[derive(Debug)]
struct MemoryBusState {
    inbound: Mutex<Option<mpsc::Sender<BusMessage>>>,
    subscribe_log: Mutex<Vec<String>>,
    subscribed: Mutex<HashSet<String>>,
    failing_topics: Mutex<HashSet<String>>,
    published: Mutex<Vec<BusMessage>>,
    publish_attempts: AtomicU32,
    publish_failures: AtomicU32,
    reconnects: AtomicU32,
}

impl MemoryBus {
    /// Creates a bus whose inbound channel holds up to `capacity` messages.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let bus = Self {
            inner: Arc::new(MemoryBusState {
                inbound: Mutex::new(Some(tx)),
                subscribe_log: Mutex::new(Vec::new()),
                subscribed: Mutex::new(HashSet::new()),
                failing_topics: Mutex::new(HashSet::new()),
                published: Mutex::new(Vec::new()),
                publish_attempts: AtomicU32::new(0),
                publish_failures: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
            }),
        };
        (bus, rx)
    }

    /// Delivers a message as if the broker had sent it.
    ///
    /// Returns `Ok(false)` if nothing is subscribed to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] after [`close`](Self::close) or once the
    /// receiver is dropped.
    pub async fn inject(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<bool, BusError> {
        if !self.inner.subscribed.lock().contains(topic) {
            return Ok(false);
        }
        let tx = self.inner.inbound.lock().clone().ok_or(BusError::Closed)?;
        tx.send(BusMessage::new(topic, payload))
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(true)
    }

    /// Ends the inbound stream once queued messages are consumed.
    pub fn close(&self) {
        self.inner.inbound.lock().take();
    }

    /// Makes every future subscription to `topic` fail.
    pub fn fail_subscribe(&self, topic: &str) {
        self.inner.failing_topics.lock().insert(topic.to_string());
    }

    /// Makes the next `count` publish attempts fail. `u32::MAX` fails all.
    pub fn fail_publishes(&self, count: u32) {
        self.inner.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Number of subscribe calls made for `topic`.
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.inner
            .subscribe_log
            .lock()
            .iter()
            .filter(|t| *t == topic)
            .count()
    }

    /// Every subscribe call in the order it was made, failed ones included.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.inner.subscribe_log.lock().clone()
    }

    /// Returns `true` if `topic` is currently subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.subscribed.lock().contains(topic)
    }

    /// Messages published successfully, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.published.lock().clone()
    }

    /// Publish attempts so far, including failed ones.
    pub fn publish_attempts(&self) -> u32 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Reconnect calls so far.
    pub fn reconnects(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.inner.subscribe_log.lock().push(topic.to_string());
        if self.inner.failing_topics.lock().contains(topic) {
            return Err(BusError::Client(format!("subscription to '{topic}' refused")));
        }
        self.inner.subscribed.lock().insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(BusError::Disconnected);
        }
        self.inner
            .published
            .lock()
            .push(BusMessage::new(topic, payload));
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BusError> {
        self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_requires_subscription() {
        let (bus, mut rx) = MemoryBus::new(4);
        assert!(!bus.inject("d1", b"[]".to_vec()).await.unwrap());

        bus.subscribe("d1").await.unwrap();
        assert!(bus.inject("d1", b"[]".to_vec()).await.unwrap());
        assert_eq!(rx.recv().await, Some(BusMessage::new("d1", b"[]".to_vec())));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (bus, mut rx) = MemoryBus::new(4);
        bus.subscribe("events").await.unwrap();
        bus.close();
        assert_eq!(bus.inject("events", b"{}".to_vec()).await, Err(BusError::Closed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_scripted_publish_failures() {
        let (bus, _rx) = MemoryBus::new(1);
        bus.fail_publishes(2);
        assert!(bus.publish("t", vec![1]).await.is_err());
        assert!(bus.publish("t", vec![2]).await.is_err());
        bus.publish("t", vec![3]).await.unwrap();
        assert_eq!(bus.publish_attempts(), 3);
        assert_eq!(bus.published(), vec![BusMessage::new("t", vec![3])]);
    }

    #[tokio::test]
    async fn test_failing_subscribe_is_counted() {
        let (bus, _rx) = MemoryBus::new(1);
        bus.fail_subscribe("d1");
        assert!(bus.subscribe("d1").await.is_err());
        assert_eq!(bus.subscribe_calls("d1"), 1);
        assert!(!bus.is_subscribed("d1"));
    }
}
