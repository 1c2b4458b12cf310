//! Rollup engine: hour/day/week/month summaries of raw samples.
//!
//! The engine keeps no state of its own. Each ingested sample triggers a full
//! recomputation of the four windows that contain it, reading the raw values
//! back from the store and overwriting the stored [`Meta`].
//!
//! # Rollup Flow
//!
//! ```text
//! sample @ t ─┬─► hour window  ─┐
//!             ├─► day window   ─┤  values_in_range ─► summarize ─► put_meta
//!             ├─► week window  ─┤
//!             └─► month window ─┘
//! ```
//!
//! Recomputing from the window rather than folding in a delta makes the
//! result independent of arrival order: replays, late samples and concurrent
//! recomputations of one window all converge on the same record.
//!
//! Windows are aligned in one configured fixed UTC offset. Weeks start on
//! Monday (ISO 8601).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};

use crate::error::Result;
use crate::model::{Meta, PeriodKind, Value};
use crate::store::TelemetryStore;

/// Half-open time window `[start, end)` of one period kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeriodWindow {
    /// Granularity.
    pub kind: PeriodKind,
    /// First instant inside the window.
    pub start: DateTime<Utc>,
    /// First instant after the window.
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    /// The window of `kind` that contains `t`, aligned in `zone`.
    ///
    /// Returns `None` only for instants at the edge of the representable
    /// calendar.
    pub fn containing(kind: PeriodKind, t: DateTime<Utc>, zone: FixedOffset) -> Option<Self> {
        let local = t.with_timezone(&zone).naive_local();
        let date = local.date();

        let (start, end): (NaiveDateTime, NaiveDateTime) = match kind {
            PeriodKind::Hour => {
                let start = date.and_hms_opt(local.hour(), 0, 0)?;
                (start, start.checked_add_signed(TimeDelta::hours(1))?)
            }
            PeriodKind::Day => (
                date.and_hms_opt(0, 0, 0)?,
                date.succ_opt()?.and_hms_opt(0, 0, 0)?,
            ),
            PeriodKind::Week => {
                let back = u64::from(date.weekday().num_days_from_monday());
                let monday = date.checked_sub_days(Days::new(back))?;
                (
                    monday.and_hms_opt(0, 0, 0)?,
                    monday.checked_add_days(Days::new(7))?.and_hms_opt(0, 0, 0)?,
                )
            }
            PeriodKind::Month => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
                };
                (first.and_hms_opt(0, 0, 0)?, next.and_hms_opt(0, 0, 0)?)
            }
        };

        Some(Self {
            kind,
            start: start.and_local_timezone(zone).single()?.with_timezone(&Utc),
            end: end.and_local_timezone(zone).single()?.with_timezone(&Utc),
        })
    }

    /// Last whole second inside the window, the inclusive bound used for
    /// store range queries.
    pub fn last_second(&self) -> DateTime<Utc> {
        self.end - TimeDelta::seconds(1)
    }

    /// Returns `true` if `t` falls inside the window.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Returns `true` for sensor types that are aggregated.
///
/// An empty type means numeric.
pub fn is_numeric_type(kind: &str) -> bool {
    kind.is_empty() || kind == "number"
}

/// Summarizes the numeric samples in `values`.
///
/// Samples whose payload does not coerce to a number are ignored. Returns
/// `None` if no sample contributed. Values are folded in iteration order, so
/// the same input always produces bit-identical output.
#[allow(clippy::cast_precision_loss)] // sample counts stay far below 2^52
pub fn summarize<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Meta> {
    let mut meta: Option<Meta> = None;
    let mut sum = 0.0;

    for reading in values
        .into_iter()
        .filter_map(|v| v.payload.as_ref().and_then(|p| p.as_f64()))
    {
        sum += reading;
        meta = Some(match meta {
            None => Meta {
                max: reading,
                min: reading,
                avg: 0.0,
                n: 1,
            },
            Some(m) => Meta {
                max: m.max.max(reading),
                min: m.min.min(reading),
                avg: 0.0,
                n: m.n + 1,
            },
        });
    }

    meta.map(|m| Meta {
        avg: sum / m.n as f64,
        ..m
    })
}

/// Recomputes rollups for samples as they land.
#[derive(Debug, Clone)]
pub struct RollupEngine {
    store: Arc<TelemetryStore>,
    zone: FixedOffset,
}

impl RollupEngine {
    /// Creates an engine writing through `store`, aligning windows in `zone`.
    pub fn new(store: Arc<TelemetryStore>, zone: FixedOffset) -> Self {
        Self { store, zone }
    }

    /// The offset windows are aligned in.
    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    /// Resolves the type of the sensor that produced `value`.
    ///
    /// The sample's own `type` wins; otherwise the device's declared output
    /// with the same id supplies it; otherwise the type is empty (numeric).
    ///
    /// # Errors
    ///
    /// Returns an error if the device record cannot be read.
    pub fn sensor_type(&self, device_id: &str, value: &Value) -> Result<String> {
        if !value.kind.is_empty() {
            return Ok(value.kind.clone());
        }
        let declared = self
            .store
            .get_device(device_id)?
            .and_then(|d| d.declared_output(&value.id).map(|o| o.kind.clone()));
        Ok(declared.unwrap_or_default())
    }

    /// Recomputes every window containing `t` for one sensor.
    ///
    /// Non-numeric sensors are skipped entirely. Returns the rollups that
    /// were written.
    ///
    /// # Errors
    ///
    /// Returns an error if reading values or writing a rollup fails.
    pub fn recompute(
        &self,
        device_id: &str,
        sensor_id: &str,
        sensor_type: &str,
        t: DateTime<Utc>,
    ) -> Result<Vec<(PeriodWindow, Meta)>> {
        if !is_numeric_type(sensor_type) {
            tracing::trace!(device = device_id, sensor = sensor_id, sensor_type, "not aggregated");
            return Ok(Vec::new());
        }

        let mut written = Vec::with_capacity(PeriodKind::ALL.len());
        for kind in PeriodKind::ALL {
            let Some(window) = PeriodWindow::containing(kind, t, self.zone) else {
                tracing::warn!(%t, period = %kind, "no period window for timestamp");
                continue;
            };
            if let Some(meta) = self.recompute_window(device_id, sensor_id, &window)? {
                written.push((window, meta));
            }
        }
        Ok(written)
    }

    /// Recomputes and stores the rollup of one window.
    ///
    /// Returns `None` (and writes nothing) if the window holds no numeric
    /// sample.
    ///
    /// # Errors
    ///
    /// Returns an error if reading values or writing the rollup fails.
    pub fn recompute_window(
        &self,
        device_id: &str,
        sensor_id: &str,
        window: &PeriodWindow,
    ) -> Result<Option<Meta>> {
        let values =
            self.store
                .values_in_range(device_id, sensor_id, window.start, window.last_second())?;
        let Some(meta) = summarize(&values) else {
            return Ok(None);
        };

        self.store
            .put_meta(device_id, sensor_id, window.kind, window.start, &meta)?;
        tracing::debug!(
            device = device_id,
            sensor = sensor_id,
            period = %window.kind,
            start = %window.start,
            n = meta.n,
            "rollup updated"
        );
        Ok(Some(meta))
    }

    /// Recomputes every window that holds at least one stored sample of
    /// the sensor. Returns the number of windows written.
    ///
    /// # Errors
    ///
    /// Returns an error if reading values or writing a rollup fails.
    pub fn rebuild_series(&self, device_id: &str, sensor_id: &str) -> Result<usize> {
        let values = self.store.all_values(device_id, sensor_id)?;
        let Some(latest) = values.last() else {
            return Ok(0);
        };
        if !is_numeric_type(&self.sensor_type(device_id, latest)?) {
            return Ok(0);
        }

        let windows: BTreeSet<PeriodWindow> = values
            .iter()
            .filter_map(|v| v.time)
            .flat_map(|t| {
                PeriodKind::ALL
                    .into_iter()
                    .filter_map(move |kind| PeriodWindow::containing(kind, t, self.zone))
            })
            .collect();

        let mut written = 0;
        for window in &windows {
            if self.recompute_window(device_id, sensor_id, window)?.is_some() {
                written += 1;
            }
        }
        tracing::info!(device = device_id, sensor = sensor_id, windows = written, "rebuilt rollups");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Payload;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn engine() -> (Arc<TelemetryStore>, RollupEngine) {
        let store = Arc::new(TelemetryStore::in_memory());
        let engine = RollupEngine::new(store.clone(), FixedOffset::east_opt(0).unwrap());
        (store, engine)
    }

    #[test]
    fn test_hour_and_day_windows() {
        let t = utc(2024, 3, 14, 15, 9, 26);
        let zone = FixedOffset::east_opt(0).unwrap();

        let hour = PeriodWindow::containing(PeriodKind::Hour, t, zone).unwrap();
        assert_eq!(hour.start, utc(2024, 3, 14, 15, 0, 0));
        assert_eq!(hour.end, utc(2024, 3, 14, 16, 0, 0));
        assert_eq!(hour.last_second(), utc(2024, 3, 14, 15, 59, 59));

        let day = PeriodWindow::containing(PeriodKind::Day, t, zone).unwrap();
        assert_eq!(day.start, utc(2024, 3, 14, 0, 0, 0));
        assert_eq!(day.end, utc(2024, 3, 15, 0, 0, 0));
    }

    #[test]
    fn test_week_starts_monday() {
        let zone = FixedOffset::east_opt(0).unwrap();
        // 2024-03-17 is a Sunday.
        let sunday = utc(2024, 3, 17, 23, 0, 0);
        let week = PeriodWindow::containing(PeriodKind::Week, sunday, zone).unwrap();
        assert_eq!(week.start, utc(2024, 3, 11, 0, 0, 0));
        assert_eq!(week.end, utc(2024, 3, 18, 0, 0, 0));

        let monday = utc(2024, 3, 18, 0, 0, 0);
        let next = PeriodWindow::containing(PeriodKind::Week, monday, zone).unwrap();
        assert_eq!(next.start, monday);
    }

    #[test]
    fn test_month_window_wraps_year() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let t = utc(2023, 12, 31, 23, 59, 59);
        let month = PeriodWindow::containing(PeriodKind::Month, t, zone).unwrap();
        assert_eq!(month.start, utc(2023, 12, 1, 0, 0, 0));
        assert_eq!(month.end, utc(2024, 1, 1, 0, 0, 0));

        let feb = PeriodWindow::containing(PeriodKind::Month, utc(2024, 2, 29, 12, 0, 0), zone).unwrap();
        assert_eq!(feb.end, utc(2024, 3, 1, 0, 0, 0));
    }

    #[test]
    fn test_day_window_uses_configured_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        // 23:30 UTC is 01:30 the next local day.
        let t = utc(2024, 6, 1, 23, 30, 0);
        let day = PeriodWindow::containing(PeriodKind::Day, t, plus_two).unwrap();
        assert_eq!(day.start, utc(2024, 6, 1, 22, 0, 0));
        assert_eq!(day.end, utc(2024, 6, 2, 22, 0, 0));
        assert!(day.contains(t));
    }

    #[test]
    fn test_summarize_mixed_payloads() {
        let t = utc(2024, 1, 1, 0, 0, 0);
        let mut values = vec![
            Value::number("s", 4.0, t),
            Value::number("s", 8.0, t),
        ];
        let mut text = Value::number("s", 0.0, t);
        text.payload = Some(Payload::Text("6".to_string()));
        values.push(text);
        let mut flag = Value::number("s", 0.0, t);
        flag.payload = Some(Payload::Bool(true));
        values.push(flag);

        let meta = summarize(&values).unwrap();
        assert_eq!(meta, Meta { max: 8.0, min: 4.0, avg: 6.0, n: 3 });
        assert!(summarize(&values[3..]).is_none());
    }

    #[test]
    fn test_hourly_example() {
        let (store, engine) = engine();
        for (minute, reading) in [(5, 10.0), (25, 20.0), (45, 30.0)] {
            let t = utc(2024, 4, 2, 9, minute, 0);
            store.append_value("d1", Value::number("temp", reading, t)).unwrap();
            engine.recompute("d1", "temp", "", t).unwrap();
        }

        let meta = store
            .get_meta("d1", "temp", PeriodKind::Hour, utc(2024, 4, 2, 9, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(meta, Meta { max: 30.0, min: 10.0, avg: 20.0, n: 3 });
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let (store, engine) = engine();
        let t = utc(2024, 4, 2, 9, 0, 0);
        store.append_value("d1", Value::number("temp", 0.1, t)).unwrap();
        store
            .append_value("d1", Value::number("temp", 0.2, t + TimeDelta::seconds(1)))
            .unwrap();

        let first = engine.recompute("d1", "temp", "number", t).unwrap();
        let second = engine.recompute("d1", "temp", "number", t).unwrap();
        assert_eq!(first.len(), 4);
        for ((_, a), (_, b)) in first.iter().zip(&second) {
            assert_eq!(a.avg.to_bits(), b.avg.to_bits());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_non_numeric_sensor_produces_no_meta() {
        let (store, engine) = engine();
        let t = utc(2024, 4, 2, 9, 0, 0);
        store.append_value("d1", Value::number("door", 1.0, t)).unwrap();

        assert!(engine.recompute("d1", "door", "bool", t).unwrap().is_empty());
        assert!(
            store
                .get_meta("d1", "door", PeriodKind::Hour, utc(2024, 4, 2, 9, 0, 0))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_empty_window_writes_nothing() {
        let (store, engine) = engine();
        let t = utc(2024, 4, 2, 9, 0, 0);
        assert!(engine.recompute("d1", "temp", "", t).unwrap().is_empty());
        assert!(store.dump(crate::store::Collection::Meta).unwrap().is_empty());
    }

    #[test]
    fn test_sensor_type_falls_back_to_declared_output() {
        let (store, engine) = engine();
        let device: crate::model::Device = serde_json::from_str(
            r#"{"id":"d1","out":[{"id":"door","type":"bool"}]}"#,
        )
        .unwrap();
        store.upsert_device(&device).unwrap();

        let t = utc(2024, 1, 1, 0, 0, 0);
        let mut sample = Value::number("door", 1.0, t);
        assert_eq!(engine.sensor_type("d1", &sample).unwrap(), "bool");

        sample.kind = "number".to_string();
        assert_eq!(engine.sensor_type("d1", &sample).unwrap(), "number");

        let other = Value::number("temp", 1.0, t);
        assert_eq!(engine.sensor_type("d1", &other).unwrap(), "");
    }
}
