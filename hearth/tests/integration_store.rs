//! Integration tests for the on-disk telemetry store.
//!
//! These tests exercise the store through its public API against a real
//! `sled` database: writes, range reads, reopen, and key ordering at the
//! edges of the timestamp encoding.

use chrono::{DateTime, TimeZone, Utc};
use hearth::model::{Device, Event, Meta, PeriodKind, Priority, Value};
use hearth::store::{Collection, TelemetryStore};
use tempfile::tempdir;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn device(id: &str) -> Device {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("{id} sensor"),
        "out": [{"id": "temp", "type": "number", "unit": "C"}],
    }))
    .unwrap()
}

#[test]
fn test_full_store_lifecycle() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("lifecycle_test");
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

    // Phase 1: write every collection
    {
        let store = TelemetryStore::open(&store_path, true).unwrap();
        store.upsert_device(&device("kitchen")).unwrap();
        store.upsert_device(&device("attic")).unwrap();

        for i in 0..10 {
            let t = base + chrono::TimeDelta::seconds(i * 60);
            store
                .append_value("kitchen", Value::number("temp", 20.0 + i as f64, t))
                .unwrap();
        }

        store
            .append_event(
                "kitchen",
                Event {
                    id: "kitchen".to_string(),
                    message: "window open".to_string(),
                    priority: Priority::Warning,
                    time: Some(base),
                    extra: serde_json::Map::new(),
                },
            )
            .unwrap();

        let meta = Meta {
            max: 29.0,
            min: 20.0,
            avg: 24.5,
            n: 10,
        };
        store
            .put_meta("kitchen", "temp", PeriodKind::Hour, base, &meta)
            .unwrap();
        store.flush().unwrap();
    }

    // Phase 2: reopen and read everything back
    let store = TelemetryStore::open(&store_path, true).unwrap();

    let ids: Vec<String> = store.list_devices().unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["attic", "kitchen"]);

    let values = store
        .values_in_range(
            "kitchen",
            "temp",
            base + chrono::TimeDelta::minutes(2),
            base + chrono::TimeDelta::minutes(4),
        )
        .unwrap();
    let readings: Vec<f64> = values
        .iter()
        .filter_map(|v| v.payload.as_ref().and_then(|p| p.as_f64()))
        .collect();
    assert_eq!(readings, vec![22.0, 23.0, 24.0]);

    let latest = store.latest_value("kitchen", "temp").unwrap().unwrap();
    assert_eq!(latest.time, Some(base + chrono::TimeDelta::minutes(9)));

    let events = store.last_events("kitchen", 5).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "window open");

    let meta = store
        .get_meta("kitchen", "temp", PeriodKind::Hour, base)
        .unwrap()
        .unwrap();
    assert_eq!(meta.n, 10);
}

#[test]
fn test_range_scan_across_epoch_and_digit_widths() {
    let temp_dir = tempdir().unwrap();
    let store = TelemetryStore::open(temp_dir.path().join("epoch"), false).unwrap();

    let times = [-86_400, -1, 5, 999_999_999, 1_000_000_000, 1_700_000_000];
    // Insert out of order; keys must still come back sorted.
    for &secs in times.iter().rev() {
        store
            .append_value("d1", Value::number("temp", secs as f64, at(secs)))
            .unwrap();
    }

    let all = store.all_values("d1", "temp").unwrap();
    let seen: Vec<i64> = all.iter().map(|v| v.time.unwrap().timestamp()).collect();
    assert_eq!(seen, vec![-86_400, -1, 5, 999_999_999, 1_000_000_000, 1_700_000_000]);

    let window = store
        .values_in_range("d1", "temp", at(-1), at(999_999_999))
        .unwrap();
    assert_eq!(window.len(), 3);
}

#[test]
fn test_series_are_isolated_by_separator() {
    let temp_dir = tempdir().unwrap();
    let store = TelemetryStore::open(temp_dir.path().join("isolation"), false).unwrap();

    store
        .append_value("d1", Value::number("temp", 1.0, at(100)))
        .unwrap();
    store
        .append_value("d1", Value::number("temp2", 2.0, at(50)))
        .unwrap();
    store
        .append_value("d10", Value::number("temp", 3.0, at(75)))
        .unwrap();

    let temp = store.values_in_range("d1", "temp", at(0), at(1_000)).unwrap();
    assert_eq!(temp.len(), 1);
    assert_eq!(temp[0].payload.as_ref().and_then(|p| p.as_f64()), Some(1.0));

    assert_eq!(store.all_values("d1", "temp2").unwrap().len(), 1);
    assert_eq!(store.all_values("d10", "temp").unwrap().len(), 1);
    assert!(store.latest_value("d1", "hum").unwrap().is_none());
}

#[test]
fn test_dump_lists_every_collection() {
    let temp_dir = tempdir().unwrap();
    let store = TelemetryStore::open(temp_dir.path().join("dump"), false).unwrap();
    store.upsert_device(&device("d1")).unwrap();
    store
        .append_value("d1", Value::number("temp", 1.0, at(1_700_000_000)))
        .unwrap();

    let devices = store.dump(Collection::Devices).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].0, "d1");

    let values = store.dump(Collection::Values).unwrap();
    assert_eq!(values[0].0, "d1/temp/1700000000");

    assert!(store.dump(Collection::Events).unwrap().is_empty());
    assert!(store.dump(Collection::Meta).unwrap().is_empty());
}
