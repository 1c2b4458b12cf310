//! Telemetry store: devices, raw values, events and rollups.
//!
//! The store is the single owner of persisted state. It is a thin typed layer
//! over four [`OrderedKv`] collections, with records encoded as JSON and keys
//! built by the [`key`](crate::key) module.
//!
//! # Design
//!
//! - Every write is one `put` into one collection, so no cross-key
//!   transaction is ever needed.
//! - Range reads seek to the first key of the range and stop at prefix
//!   exhaustion or at the end bound, whichever comes first.
//! - Rows that fail to decode during a scan are logged and skipped; the read
//!   path degrades to fewer results rather than failing outright.
//!
//! # File Layout
//!
//! ```text
//! store_dir/               <- sled database
//! ├── tree "devices"       <- device_id -> Device JSON
//! ├── tree "values"        <- device/sensor/ts -> Value JSON
//! ├── tree "events"        <- event_id/ts -> Event JSON
//! └── tree "meta"          <- device/sensor/period/start -> Meta JSON
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use hearth::store::TelemetryStore;
//! use hearth::model::Value;
//! use chrono::Utc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = TelemetryStore::open("./db", true)?;
//!
//! let now = Utc::now();
//! store.append_value("d1", Value::number("temp", 21.5, now))?;
//!
//! let latest = store.latest_value("d1", "temp")?;
//! assert!(latest.is_some());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StoreError};
use crate::key::{self, SeriesPrefix};
use crate::kv::{MemoryKv, OrderedKv, SledKv};
use crate::model::{Device, Event, Meta, PeriodKind, Value, effective_time};

/// One of the four persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Device records keyed by id.
    Devices,
    /// Raw samples.
    Values,
    /// Events.
    Events,
    /// Rollups.
    Meta,
}

impl Collection {
    /// Name of the collection (also its sled tree name).
    pub fn name(self) -> &'static str {
        match self {
            Self::Devices => "devices",
            Self::Values => "values",
            Self::Events => "events",
            Self::Meta => "meta",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "devices" => Ok(Self::Devices),
            "values" => Ok(Self::Values),
            "events" => Ok(Self::Events),
            "meta" => Ok(Self::Meta),
            other => Err(StoreError::UnknownCollection {
                name: other.to_string(),
            }),
        }
    }
}

/// Typed access to the four telemetry collections.
///
/// # Thread Safety
///
/// `TelemetryStore` is `Send + Sync`; share it behind an `Arc`. Concurrent
/// writers to the same key resolve as last-write-wins.
#[derive(Debug)]
pub struct TelemetryStore {
    devices: Box<dyn OrderedKv>,
    values: Box<dyn OrderedKv>,
    events: Box<dyn OrderedKv>,
    meta: Box<dyn OrderedKv>,
    db: Option<sled::Db>,
}

impl TelemetryStore {
    /// Opens (or creates) a store directory.
    ///
    /// With `sync_writes`, each write is flushed to disk before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let open_err = |e: sled::Error| StoreError::Open {
            path: path.display().to_string(),
            source: e.into(),
        };

        let db = sled::Config::new().path(path).open().map_err(open_err)?;
        let tree = |c: Collection| -> std::result::Result<Box<dyn OrderedKv>, StoreError> {
            let tree = db.open_tree(c.name()).map_err(open_err)?;
            Ok(Box::new(SledKv::new(tree, sync_writes)))
        };

        let store = Self {
            devices: tree(Collection::Devices)?,
            values: tree(Collection::Values)?,
            events: tree(Collection::Events)?,
            meta: tree(Collection::Meta)?,
            db: Some(db.clone()),
        };
        tracing::debug!(path = %path.display(), sync_writes, "opened telemetry store");
        Ok(store)
    }

    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::from_backends(
            Box::new(MemoryKv::new()),
            Box::new(MemoryKv::new()),
            Box::new(MemoryKv::new()),
            Box::new(MemoryKv::new()),
        )
    }

    /// Builds a store over caller-supplied collections.
    pub fn from_backends(
        devices: Box<dyn OrderedKv>,
        values: Box<dyn OrderedKv>,
        events: Box<dyn OrderedKv>,
        meta: Box<dyn OrderedKv>,
    ) -> Self {
        Self {
            devices,
            values,
            events,
            meta,
            db: None,
        }
    }

    fn kv(&self, collection: Collection) -> &dyn OrderedKv {
        match collection {
            Collection::Devices => self.devices.as_ref(),
            Collection::Values => self.values.as_ref(),
            Collection::Events => self.events.as_ref(),
            Collection::Meta => self.meta.as_ref(),
        }
    }

    fn put_json<T: Serialize>(&self, collection: Collection, key: &[u8], record: &T) -> Result<()> {
        let payload = serde_json::to_vec(record).map_err(|e| StoreError::Encode {
            collection: collection.name(),
            source: e,
        })?;
        self.kv(collection)
            .put(key, &payload)
            .map_err(|e| StoreError::Backend {
                collection: collection.name(),
                source: e,
            })?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, collection: Collection, key: &[u8]) -> Result<Option<T>> {
        let raw = self.kv(collection).get(key).map_err(|e| StoreError::Backend {
            collection: collection.name(),
            source: e,
        })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&raw).map_err(|e| StoreError::Decode {
            collection: collection.name(),
            key: key::display_key(key),
            source: e,
        })?;
        Ok(Some(record))
    }

    /// Walks one series starting at `from`.
    ///
    /// Stops at prefix exhaustion, when `past_end` returns `true` for a
    /// timestamp, or after `limit` decoded records.
    fn scan<T: DeserializeOwned>(
        &self,
        collection: Collection,
        prefix: &SeriesPrefix,
        from: i64,
        reverse: bool,
        past_end: impl Fn(i64) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<(i64, T)>> {
        let mut out = Vec::new();
        if limit == Some(0) {
            return Ok(out);
        }

        for item in self.kv(collection).iterate(&prefix.at(from), reverse) {
            let (k, v) = item.map_err(|e| StoreError::Backend {
                collection: collection.name(),
                source: e,
            })?;
            let Some(ts) = prefix.timestamp_of(&k) else {
                break;
            };
            if past_end(ts) {
                break;
            }
            match serde_json::from_slice::<T>(&v) {
                Ok(record) => out.push((ts, record)),
                Err(e) => {
                    tracing::warn!(
                        collection = collection.name(),
                        key = %key::display_key(&k),
                        error = %e,
                        "skipping undecodable record"
                    );
                    continue;
                }
            }
            if limit.is_some_and(|n| out.len() >= n) {
                break;
            }
        }
        Ok(out)
    }

    // --- devices ---

    /// Writes a device record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a valid key or the write fails.
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        let key = key::device_key(&device.id)?;
        self.put_json(Collection::Devices, &key, device)
    }

    /// Reads one device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid, the read fails, or the stored
    /// record is corrupt.
    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let key = key::device_key(device_id)?;
        self.get_json(Collection::Devices, &key)
    }

    /// Lists every device in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if iteration fails. Undecodable records are skipped.
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for item in self.devices.iterate(&[], false) {
            let (k, v) = item.map_err(|e| StoreError::Backend {
                collection: Collection::Devices.name(),
                source: e,
            })?;
            match serde_json::from_slice::<Device>(&v) {
                Ok(device) => devices.push(device),
                Err(e) => tracing::warn!(
                    key = %String::from_utf8_lossy(&k),
                    error = %e,
                    "skipping undecodable device record"
                ),
            }
        }
        Ok(devices)
    }

    // --- values ---

    /// Stores one sample for `device_id`.
    ///
    /// An unset sample time is replaced by the current time before the key is
    /// built. Returns the effective timestamp, which the caller feeds to the
    /// rollup engine. A sample with the same (device, sensor, second)
    /// replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is not a valid key or the write fails.
    pub fn append_value(&self, device_id: &str, mut value: Value) -> Result<DateTime<Utc>> {
        let time = effective_time(value.time, Utc::now());
        value.time = Some(time);

        let prefix = SeriesPrefix::values(device_id, &value.id)?;
        self.put_json(Collection::Values, &prefix.at(time.timestamp()), &value)?;
        Ok(time)
    }

    /// Samples of one sensor with `start <= time <= end`, oldest first.
    ///
    /// `start` is exact. `end` is compared at whole-second resolution, so
    /// it covers every sample stamped within its second; for a half-open
    /// window pass `end - 1s`.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid or iteration fails. An empty
    /// series yields an empty vector.
    pub fn values_in_range(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let prefix = SeriesPrefix::values(device_id, sensor_id)?;
        let end = end.timestamp();
        let rows = self.scan(
            Collection::Values,
            &prefix,
            start.timestamp(),
            false,
            |ts| ts > end,
            None,
        )?;
        Ok(rows
            .into_iter()
            .map(|(_, v)| v)
            .filter(|v: &Value| v.time.is_none_or(|t| t >= start))
            .collect())
    }

    /// Every sample of one sensor, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid or iteration fails.
    pub fn all_values(&self, device_id: &str, sensor_id: &str) -> Result<Vec<Value>> {
        let prefix = SeriesPrefix::values(device_id, sensor_id)?;
        let rows = self.scan(Collection::Values, &prefix, i64::MIN, false, |_| false, None)?;
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    /// Most recent sample of one sensor.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid or iteration fails.
    pub fn latest_value(&self, device_id: &str, sensor_id: &str) -> Result<Option<Value>> {
        let prefix = SeriesPrefix::values(device_id, sensor_id)?;
        let rows = self.scan(Collection::Values, &prefix, i64::MAX, true, |_| false, Some(1))?;
        Ok(rows.into_iter().next().map(|(_, v)| v))
    }

    // --- events ---

    /// Stores one event under `event_id`, stamping an unset time.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a valid key or the write fails.
    pub fn append_event(&self, event_id: &str, mut event: Event) -> Result<DateTime<Utc>> {
        let time = effective_time(event.time, Utc::now());
        event.time = Some(time);

        let prefix = SeriesPrefix::events(event_id)?;
        self.put_json(Collection::Events, &prefix.at(time.timestamp()), &event)?;
        Ok(time)
    }

    /// The `count` most recent events of one source, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or iteration fails.
    pub fn last_events(&self, event_id: &str, count: usize) -> Result<Vec<Event>> {
        let prefix = SeriesPrefix::events(event_id)?;
        let rows = self.scan(Collection::Events, &prefix, i64::MAX, true, |_| false, Some(count))?;
        Ok(rows.into_iter().map(|(_, e)| e).collect())
    }

    /// Events of one source with `start <= time <= end`, oldest first.
    ///
    /// Bounds are resolved like [`values_in_range`](Self::values_in_range).
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or iteration fails.
    pub fn events_in_range(
        &self,
        event_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let prefix = SeriesPrefix::events(event_id)?;
        let end = end.timestamp();
        let rows = self.scan(
            Collection::Events,
            &prefix,
            start.timestamp(),
            false,
            |ts| ts > end,
            None,
        )?;
        Ok(rows
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e: &Event| e.time.is_none_or(|t| t >= start))
            .collect())
    }

    // --- meta ---

    /// Reads the rollup of one period window.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid, the read fails, or the record is
    /// corrupt.
    pub fn get_meta(
        &self,
        device_id: &str,
        sensor_id: &str,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Result<Option<Meta>> {
        let prefix = SeriesPrefix::meta(device_id, sensor_id, kind)?;
        self.get_json(Collection::Meta, &prefix.at(period_start.timestamp()))
    }

    /// Overwrites the rollup of one period window.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid or the write fails.
    pub fn put_meta(
        &self,
        device_id: &str,
        sensor_id: &str,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        meta: &Meta,
    ) -> Result<()> {
        let prefix = SeriesPrefix::meta(device_id, sensor_id, kind)?;
        self.put_json(Collection::Meta, &prefix.at(period_start.timestamp()), meta)
    }

    /// Rollups of one granularity whose window starts within
    /// `start..=end`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is invalid or iteration fails.
    pub fn meta_in_range(
        &self,
        device_id: &str,
        sensor_id: &str,
        kind: PeriodKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Meta)>> {
        let prefix = SeriesPrefix::meta(device_id, sensor_id, kind)?;
        let end = end.timestamp();
        let rows = self.scan::<Meta>(
            Collection::Meta,
            &prefix,
            start.timestamp(),
            false,
            |ts| ts > end,
            None,
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|(ts, meta)| DateTime::from_timestamp(ts, 0).map(|t| (t, meta)))
            .collect())
    }

    // --- maintenance ---

    /// Every raw pair of one collection, keys rendered for display.
    ///
    /// # Errors
    ///
    /// Returns an error if iteration fails.
    pub fn dump(&self, collection: Collection) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.kv(collection).iterate(&[], false) {
            let (k, v) = item.map_err(|e| StoreError::Backend {
                collection: collection.name(),
                source: e,
            })?;
            let key = match collection {
                Collection::Devices => String::from_utf8_lossy(&k).into_owned(),
                _ => key::display_key(&k),
            };
            out.push((key, String::from_utf8_lossy(&v).into_owned()));
        }
        Ok(out)
    }

    /// Flushes every collection to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any collection fails to flush.
    pub fn flush(&self) -> Result<()> {
        for collection in [
            Collection::Devices,
            Collection::Values,
            Collection::Events,
            Collection::Meta,
        ] {
            self.kv(collection).flush().map_err(|e| StoreError::Backend {
                collection: collection.name(),
                source: e,
            })?;
        }
        if let Some(db) = &self.db {
            db.flush().map_err(|e| StoreError::Backend {
                collection: "database",
                source: e.into(),
            })?;
        }
        Ok(())
    }
}
