//! Error types for the hearth telemetry core.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all hearth operations.
///
/// Each subsystem defines its own error enum; this type wraps them so callers
/// that cross subsystem boundaries (the ingestion manager, the CLI) can use a
/// single `Result` alias.
#[derive(Error, Debug)]
pub enum HearthError {
    /// An identifier could not be encoded into a key.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The ordered key-value primitive failed.
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// A telemetry store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A bus transport operation failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// An outbound command could not be published.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// The ingestion manager stopped on a fatal condition.
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while encoding identifiers into keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// A key component was empty.
    #[error("{field} must not be empty")]
    EmptyComponent {
        /// Which component was empty (e.g. "device id").
        field: &'static str,
    },

    /// A key component contained the separator byte.
    #[error("{field} '{value}' contains the reserved separator byte 0x1f")]
    ReservedByte {
        /// Which component was rejected.
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Errors raised by an ordered key-value backend.
#[derive(Error, Debug)]
pub enum KvError {
    /// The sled engine reported an error.
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// Errors that can occur in telemetry store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory could not be opened.
    #[error("failed to open store at '{path}': {source}")]
    Open {
        /// The directory that could not be opened.
        path: String,
        /// The underlying backend error.
        #[source]
        source: KvError,
    },

    /// The underlying primitive failed on a read or write.
    #[error("{collection} collection: {source}")]
    Backend {
        /// Collection name (devices, values, events, meta).
        collection: &'static str,
        /// The underlying backend error.
        #[source]
        source: KvError,
    },

    /// A record could not be serialized before writing.
    #[error("failed to encode {collection} record: {source}")]
    Encode {
        /// Collection name.
        collection: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored record could not be decoded.
    #[error("failed to decode {collection} record '{key}': {source}")]
    Decode {
        /// Collection name.
        collection: &'static str,
        /// Printable form of the offending key.
        key: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The requested collection name does not exist.
    #[error("unknown collection '{name}' (expected devices, values, events or meta)")]
    UnknownCollection {
        /// The name that was asked for.
        name: String,
    },

    /// A blocking store task was cancelled or panicked.
    #[error("store task failed: {reason}")]
    TaskFailed {
        /// Description from the runtime.
        reason: String,
    },
}

/// Errors from the publish/subscribe transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The client rejected the request.
    #[error("client error: {0}")]
    Client(String),

    /// The operation did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation name (subscribe, publish, reconnect).
        operation: &'static str,
        /// How long we waited.
        timeout: Duration,
    },

    /// The broker connection is down.
    #[error("not connected to broker")]
    Disconnected,

    /// The bus has been shut down.
    #[error("bus is closed")]
    Closed,
}

/// Errors returned to callers of the outbound command path.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Every attempt failed.
    #[error("publish to '{topic}' failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Topic the command was addressed to.
        topic: String,
        /// Attempts performed.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: BusError,
    },

    /// The command could not be serialized.
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    /// The device declares methods and this is not one of them.
    #[error("device '{device}' does not declare method '{method}'")]
    UnknownMethod {
        /// Target device.
        device: String,
        /// Requested method.
        method: String,
    },
}

/// Conditions that stop the ingestion manager.
#[derive(Error, Debug)]
pub enum IngestError {
    /// A topic subscription failed; continuing would silently drop data.
    #[error("failed to subscribe to '{topic}': {source}")]
    Subscribe {
        /// Topic that could not be subscribed.
        topic: String,
        /// The transport error.
        #[source]
        source: BusError,
    },

    /// Known devices could not be read back at startup.
    #[error("failed to restore subscriptions: {0}")]
    Restore(#[source] StoreError),
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`HearthConfig`](crate::config::HearthConfig).
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, HearthError>`.
pub type Result<T> = std::result::Result<T, HearthError>;
