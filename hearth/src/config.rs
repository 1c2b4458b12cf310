//! Runtime configuration.
//!
//! Configuration is a JSON document; every field has a default, so an empty
//! object `{}` is a valid config. The CLI overrides individual fields from
//! its flags after loading.
//!
//! ```json
//! {
//!   "store_path": "./db",
//!   "mqtt": { "host": "broker.local", "port": 1883 },
//!   "utc_offset": "+02:00",
//!   "publish": { "max_attempts": 5 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::bus::BusTimeouts;
use crate::error::{ConfigError, Result};

/// Top-level configuration of a hearth process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    /// Directory of the on-disk store.
    pub store_path: PathBuf,
    /// Flush every write before acknowledging it.
    pub sync_writes: bool,
    /// Broker connection.
    pub mqtt: MqttConfig,
    /// Offset used for rollup period boundaries, as `+HH:MM`, `-HH:MM` or
    /// `UTC`.
    pub utc_offset: String,
    /// Command publishing.
    pub publish: PublishConfig,
    /// How long one subscription may take, in milliseconds.
    pub subscribe_timeout_ms: u64,
    /// Capacity of the notification queue.
    pub notify_capacity: usize,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./db"),
            sync_writes: true,
            mqtt: MqttConfig::default(),
            utc_offset: "+00:00".to_string(),
            publish: PublishConfig::default(),
            subscribe_timeout_ms: 10_000,
            notify_capacity: 256,
        }
    }
}

impl HearthConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// a field fails [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the store directory.
    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Sets the broker address.
    #[must_use]
    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.mqtt.host = host.into();
        self.mqtt.port = port;
        self
    }

    /// Sets the rollup offset.
    #[must_use]
    pub fn with_utc_offset(mut self, offset: impl Into<String>) -> Self {
        self.utc_offset = offset.into();
        self
    }

    /// Checks every field for usable values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.client_id.is_empty() {
            return Err(invalid("mqtt.client_id", "must not be empty"));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(invalid("mqtt.keep_alive_secs", "must be at least 5"));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(invalid("mqtt.channel_capacity", "must be greater than 0"));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            return Err(invalid("mqtt.password", "requires mqtt.username"));
        }
        if self.publish.max_attempts == 0 {
            return Err(invalid("publish.max_attempts", "must be at least 1"));
        }
        if self.publish.attempt_timeout_ms == 0 {
            return Err(invalid("publish.attempt_timeout_ms", "must be greater than 0"));
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(invalid("subscribe_timeout_ms", "must be greater than 0"));
        }
        if self.notify_capacity == 0 {
            return Err(invalid("notify_capacity", "must be greater than 0"));
        }
        self.zone()?;
        Ok(())
    }

    /// The fixed offset rollup periods are aligned to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `utc_offset` does not parse.
    pub fn zone(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
            .ok_or_else(|| invalid("utc_offset", format!("'{}' is not +HH:MM", self.utc_offset)))
    }

    /// Timeouts for the MQTT bus.
    pub fn bus_timeouts(&self) -> BusTimeouts {
        BusTimeouts {
            subscribe: Duration::from_millis(self.subscribe_timeout_ms),
            publish: self.publish.attempt_timeout(),
            reconnect: self.publish.reconnect_timeout(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password; requires `username`.
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Capacity of the client request queue and of the inbound channel.
    pub channel_capacity: usize,
    /// Pause after a failed connection attempt, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hearth".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            channel_capacity: 64,
            reconnect_delay_ms: 1_000,
        }
    }
}

/// Retry policy for command publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Time allowed for one attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Time allowed for reconnecting between attempts, in milliseconds.
    pub reconnect_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout_ms: 5_000,
            reconnect_timeout_ms: 10_000,
        }
    }
}

impl PublishConfig {
    /// Time allowed for one attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Time allowed for reconnecting between attempts.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> crate::error::HearthError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
    .into()
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM`, `Z` or `UTC`.
pub fn parse_utc_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("utc") || text == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 && rest.is_ascii() => rest.split_at(2),
        None => return None,
    };
    let two_digits = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(hours) || !two_digits(minutes) {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
