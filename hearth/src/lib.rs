//! # hearth
//!
//! Telemetry ingestion core for a home-automation hub.
//!
//! hearth listens on an MQTT broker for device announcements, sensor samples
//! and events, stores them in an embedded ordered key-value store, and keeps
//! hour/day/week/month summaries of every numeric sensor up to date as
//! samples land.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Order-preserving keys: range scans over a sensor return samples in time
//!   order, including times before 1970 and across digit-width boundaries
//! - Rollups are recomputed from the whole window, so late and replayed
//!   samples converge on the same summary
//! - Every device topic is subscribed at most once, and known devices are
//!   resubscribed before discovery is heard
//! - A failed subscription stops ingestion instead of silently dropping data
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hearth::{HearthConfig, IngestionManager, MqttBus, Notifier, RollupEngine, TelemetryStore};
//! use hearth::notify::TracingSink;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HearthConfig::default().with_broker("localhost", 1883);
//! let store = Arc::new(TelemetryStore::open(&config.store_path, config.sync_writes)?);
//! let rollup = RollupEngine::new(Arc::clone(&store), config.zone()?);
//! let (bus, inbound) = MqttBus::connect(&config.mqtt, config.bus_timeouts());
//! let (notifier, _notifications) = Notifier::spawn(Arc::new(TracingSink), config.notify_capacity);
//!
//! let manager = IngestionManager::new(store, rollup, Arc::new(bus), notifier, config.publish);
//! manager.start().await?;
//! manager.run(inbound).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`TelemetryStore`] — Devices, values, events and rollups over four
//!   ordered collections
//! - [`RollupEngine`] — Recomputes the windows containing a new sample
//! - [`IngestionManager`] — Routes bus messages, owns the subscription table,
//!   publishes commands
//! - [`Bus`] — Publish/subscribe transport ([`MqttBus`], [`MemoryBus`])
//! - [`Notifier`] — Bounded, lossy queue of human-facing notices
//!
//! ## Modules
//!
//! - [`key`] — Fixed-width, order-preserving key encoding
//! - [`kv`] — Ordered key-value primitive (`sled` and in-memory)
//! - [`model`] — Wire and storage records
//! - [`store`] — Collections and range queries
//! - [`rollup`] — Period windows and summaries
//! - [`bus`] — Transport abstraction and implementations
//! - [`ingest`] — Message dispatch and command publishing
//! - [`notify`] — Notifications
//! - [`config`] — Runtime configuration
//! - [`error`] — Error types

pub mod bus;
pub mod config;
pub mod error;
pub mod ingest;
pub mod key;
pub mod kv;
pub mod model;
pub mod notify;
pub mod rollup;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use bus::{Bus, BusMessage, MemoryBus, MqttBus};
pub use config::HearthConfig;
pub use error::{HearthError, Result};
pub use ingest::{IngestionManager, SubscriptionState, SubscriptionTable};
pub use model::{Command, Device, Event, Meta, PeriodKind, Priority, Value};
pub use notify::Notifier;
pub use rollup::{PeriodWindow, RollupEngine};
pub use store::{Collection, TelemetryStore};
