//! Message-bus client abstraction.
//!
//! The ingestion manager talks to the broker only through [`Bus`]. Inbound
//! messages do not flow through the trait: each implementation hands out an
//! `mpsc::Receiver<BusMessage>` when it is constructed, and the manager
//! drains that receiver.
//!
//! # Topics
//!
//! ```text
//! discovery        device descriptors (JSON Device)
//! events           event notifications (JSON Event)
//! <device-id>      sensor samples (JSON array of Value)
//! <device-id>-call commands sent to the device (JSON Command)
//! ```

use async_trait::async_trait;

use crate::error::BusError;

mod memory;
mod mqtt;

pub use memory::MemoryBus;
pub use mqtt::{BusTimeouts, MqttBus};

/// Topic carrying device descriptors.
pub const DISCOVERY_TOPIC: &str = "discovery";

/// Topic carrying event notifications.
pub const EVENTS_TOPIC: &str = "events";

const CALL_SUFFIX: &str = "-call";

/// Topic a device listens on for commands.
pub fn call_topic(device_id: &str) -> String {
    format!("{device_id}{CALL_SUFFIX}")
}

/// Returns `true` if `id` would collide with a fixed or command topic when
/// used as a device topic.
pub fn is_reserved_topic(id: &str) -> bool {
    id == DISCOVERY_TOPIC || id == EVENTS_TOPIC || id.ends_with(CALL_SUFFIX)
}

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Creates a message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribes to `topic`. Returns once the subscription is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription cannot be established.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Publishes `payload` on `topic`. Returns once the broker client has
    /// accepted the message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the transport is down or rejects the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Re-establishes the connection, or waits for it to come back.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the connection is not restored.
    async fn reconnect(&self) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_topic() {
        assert_eq!(call_topic("lamp"), "lamp-call");
    }

    #[test]
    fn test_reserved_topics() {
        assert!(is_reserved_topic("discovery"));
        assert!(is_reserved_topic("events"));
        assert!(is_reserved_topic("lamp-call"));
        assert!(!is_reserved_topic("lamp"));
        assert!(!is_reserved_topic("eventsource"));
    }
}
