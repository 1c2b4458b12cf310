//! Benchmarks for the sample write path.
//!
//! Measures appending a sample, appending plus recomputing its four rollup
//! windows as the window fills up, and range reads.
//!
//! Run with: `cargo bench -p hearth -- ingest`

#![allow(missing_docs, clippy::cast_precision_loss)]

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hearth::model::Value;
use hearth::rollup::RollupEngine;
use hearth::store::TelemetryStore;
use tempfile::tempdir;

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Opens an on-disk store without per-write flushes.
fn setup_store() -> (Arc<TelemetryStore>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let store = TelemetryStore::open(temp_dir.path().join("bench_store"), false).unwrap();
    (Arc::new(store), temp_dir)
}

fn bench_append(c: &mut Criterion) {
    let (store, _dir) = setup_store();
    let mut t = base_time();

    c.bench_function("ingest/append_value", |b| {
        b.iter(|| {
            t += TimeDelta::seconds(1);
            store
                .append_value(black_box("d1"), Value::number("temp", black_box(21.5), t))
                .unwrap();
        });
    });
}

fn bench_append_with_rollup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/append_with_rollup");

    // Rollup cost grows with the number of samples already in the window.
    for prefill in [0_i64, 60, 600, 3_000] {
        let (store, _dir) = setup_store();
        let engine = RollupEngine::new(Arc::clone(&store), FixedOffset::east_opt(0).unwrap());
        let start = base_time();
        for i in 0..prefill {
            store
                .append_value("d1", Value::number("temp", i as f64, start + TimeDelta::seconds(i)))
                .unwrap();
        }

        let mut next = prefill;
        group.bench_with_input(BenchmarkId::from_parameter(prefill), &prefill, |b, _| {
            b.iter(|| {
                let t = start + TimeDelta::seconds(next % 3_600);
                next += 1;
                let time = store
                    .append_value("d1", Value::number("temp", black_box(20.0), t))
                    .unwrap();
                engine.recompute("d1", "temp", "number", time).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_range_read(c: &mut Criterion) {
    let (store, _dir) = setup_store();
    let start = base_time();
    for i in 0..10_000 {
        store
            .append_value("d1", Value::number("temp", i as f64, start + TimeDelta::seconds(i)))
            .unwrap();
    }
    // A sibling series the scan must stop in front of.
    for i in 0..1_000 {
        store
            .append_value("d1", Value::number("temp2", 0.0, start + TimeDelta::seconds(i)))
            .unwrap();
    }

    let mut group = c.benchmark_group("ingest/values_in_range");
    for span in [60_i64, 3_600, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(span), &span, |b, &span| {
            b.iter(|| {
                let values = store
                    .values_in_range("d1", "temp", start, start + TimeDelta::seconds(span - 1))
                    .unwrap();
                black_box(values.len())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_append_with_rollup, bench_range_read);
criterion_main!(benches);
