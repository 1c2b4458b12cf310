//! Outbound notifications.
//!
//! Ingestion never waits on a notification. Notices go into a bounded queue
//! drained by one consumer task that hands them to a [`NotificationSink`];
//! when the queue is full the notice is dropped and counted.
//!
//! Two kinds of notices exist: stored events with a message, rendered for a
//! chat, and an activity line for every message that arrives on the bus.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::model::{Event, Priority};

/// Longest payload excerpt kept in an activity line, in bytes.
const ACTIVITY_PAYLOAD_LIMIT: usize = 256;

/// An event worth telling a human about.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotice {
    /// Event source.
    pub id: String,
    /// Event text; never empty.
    pub message: String,
    /// Severity.
    pub priority: Priority,
    /// Effective event time.
    pub time: DateTime<Utc>,
}

impl EventNotice {
    /// Builds a notice for a stored event, or `None` if it has no message.
    pub fn from_event(event: &Event, time: DateTime<Utc>) -> Option<Self> {
        if event.message.trim().is_empty() {
            return None;
        }
        Some(Self {
            id: event.id.clone(),
            message: event.message.clone(),
            priority: event.priority,
            time,
        })
    }
}

impl fmt::Display for EventNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.priority {
            Priority::Ok => "✅",
            Priority::Warning | Priority::Error => "⚠️",
        };
        write!(
            f,
            "{marker} [{}] {}",
            self.time.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.message
        )
    }
}

/// Something for a [`NotificationSink`] to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A stored event.
    Event(EventNotice),
    /// One bus message, rendered as `[topic] payload`.
    Activity(String),
}

impl Notice {
    /// Activity line for a message received on `topic`.
    pub fn activity(topic: &str, payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let mut excerpt = text.trim();
        if excerpt.len() > ACTIVITY_PAYLOAD_LIMIT {
            let mut cut = ACTIVITY_PAYLOAD_LIMIT;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt = &excerpt[..cut];
        }
        Self::Activity(format!("[{topic}] {excerpt}"))
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(event) => fmt::Display::fmt(event, f),
            Self::Activity(line) => f.write_str(line),
        }
    }
}

/// Destination for notices (a chat bot, a websocket fan-out, a log).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers one notice. Delivery failures are the sink's to log.
    async fn deliver(&self, notice: Notice);
}

/// Sink that writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notice: Notice) {
        match &notice {
            Notice::Event(event) => {
                tracing::info!(source = %event.id, priority = ?event.priority, "{notice}");
            }
            Notice::Activity(_) => tracing::debug!(target: "hearth::activity", "{notice}"),
        }
    }
}

/// Producer side of the notification queue.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notice>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Creates a queue of `capacity` notices and spawns its consumer.
    ///
    /// The consumer exits once every `Notifier` clone is dropped and the
    /// queue is drained.
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notice>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                sink.deliver(notice).await;
            }
        });
        let notifier = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (notifier, handle)
    }

    /// Queues a notice without waiting. Returns `false` if it was dropped.
    pub fn notify(&self, notice: Notice) -> bool {
        match self.tx.try_send(notice) {
            Ok(()) => true,
            Err(TrySendError::Full(notice)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped = total, "notification queue full, dropping: {notice}");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queues an activity line for a received message.
    pub fn activity(&self, topic: &str, payload: &[u8]) -> bool {
        self.notify(Notice::activity(topic, payload))
    }

    /// Number of notices dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
