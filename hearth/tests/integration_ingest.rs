//! Integration tests for bus ingestion.
//!
//! These tests run the ingestion manager end to end over the in-memory bus:
//! startup ordering, discovery, values and events flowing into the store,
//! rollups, notifications, and the fatal subscription path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone, Utc};
use hearth::bus::{BusMessage, MemoryBus};
use hearth::config::PublishConfig;
use hearth::error::IngestError;
use hearth::model::{Device, PeriodKind};
use hearth::notify::{NotificationSink, Notice, Notifier};
use hearth::{IngestionManager, RollupEngine, SubscriptionState, TelemetryStore};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Collect(Mutex<Vec<Notice>>);

#[async_trait]
impl NotificationSink for Collect {
    async fn deliver(&self, notice: Notice) {
        self.0.lock().push(notice);
    }
}

struct Harness {
    manager: IngestionManager,
    bus: MemoryBus,
    store: Arc<TelemetryStore>,
    notices: Arc<Collect>,
    inbound: Option<mpsc::Receiver<BusMessage>>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(TelemetryStore::in_memory());
        let rollup = RollupEngine::new(Arc::clone(&store), FixedOffset::east_opt(0).unwrap());
        let (bus, inbound) = MemoryBus::new(64);
        let notices = Arc::new(Collect::default());
        let (notifier, _consumer) = Notifier::spawn(notices.clone(), 64);
        let manager = IngestionManager::new(
            Arc::clone(&store),
            rollup,
            Arc::new(bus.clone()),
            notifier,
            PublishConfig::default(),
        );
        Self {
            manager,
            bus,
            store,
            notices,
            inbound: Some(inbound),
        }
    }

    async fn start(&mut self) -> JoinHandle<Result<(), IngestError>> {
        self.manager.start().await.unwrap();
        let manager = self.manager.clone();
        let inbound = self.inbound.take().unwrap();
        tokio::spawn(async move { manager.run(inbound).await })
    }
}

fn discovery(id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": id,
        "name": id,
        "out": [
            {"id": "temp", "type": "number", "unit": "C"},
            {"id": "door", "type": "bool"}
        ],
        "methods": [{"name": "toggle"}]
    }))
    .unwrap()
}

/// Polls `condition` until it holds or five seconds pass.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_discovery_then_values_flow_into_store() {
    let mut harness = Harness::new();
    let run = harness.start().await;

    harness.bus.inject("discovery", discovery("kitchen")).await.unwrap();
    let bus = harness.bus.clone();
    wait_until(|| bus.is_subscribed("kitchen")).await;

    let samples = serde_json::json!([
        {"id": "temp", "value": 10, "time": "2024-03-01T10:05:00Z"},
        {"id": "temp", "value": "30", "time": "2024-03-01T10:45:00Z"},
        {"id": "door", "value": true, "time": "2024-03-01T10:06:00Z"}
    ]);
    harness
        .bus
        .inject("kitchen", serde_json::to_vec(&samples).unwrap())
        .await
        .unwrap();

    harness.bus.close();
    run.await.unwrap().unwrap();

    let devices = harness.store.list_devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "kitchen");

    assert_eq!(harness.store.all_values("kitchen", "temp").unwrap().len(), 2);
    assert_eq!(harness.store.all_values("kitchen", "door").unwrap().len(), 1);

    let hour = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let meta = harness
        .store
        .get_meta("kitchen", "temp", PeriodKind::Hour, hour)
        .unwrap()
        .unwrap();
    assert_eq!((meta.min, meta.max, meta.avg, meta.n), (10.0, 30.0, 20.0, 2));

    // The boolean sensor is stored but never aggregated.
    assert!(harness
        .store
        .get_meta("kitchen", "door", PeriodKind::Hour, hour)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_repeated_discovery_subscribes_once() {
    let mut harness = Harness::new();
    let run = harness.start().await;

    for _ in 0..5 {
        harness.bus.inject("discovery", discovery("attic")).await.unwrap();
    }
    harness.bus.close();
    run.await.unwrap().unwrap();

    assert_eq!(harness.bus.subscribe_calls("attic"), 1);
    assert_eq!(
        harness.manager.subscriptions().state("attic"),
        SubscriptionState::Subscribed
    );
    assert_eq!(harness.store.list_devices().unwrap().len(), 1);
}

#[tokio::test]
async fn test_known_devices_restored_before_discovery() {
    let mut harness = Harness::new();
    for id in ["attic", "garage"] {
        let device: Device = serde_json::from_slice(&discovery(id)).unwrap();
        harness.store.upsert_device(&device).unwrap();
    }

    let run = harness.start().await;

    let log = harness.bus.subscribe_log();
    let discovery_at = log.iter().position(|t| t == "discovery").unwrap();
    let events_at = log.iter().position(|t| t == "events").unwrap();
    for device in ["attic", "garage"] {
        let at = log.iter().position(|t| t == device).unwrap();
        assert!(at < discovery_at && at < events_at, "{device} restored late: {log:?}");
    }

    // A rediscovered device is not subscribed again.
    harness.bus.inject("discovery", discovery("garage")).await.unwrap();
    harness.bus.close();
    run.await.unwrap().unwrap();
    assert_eq!(harness.bus.subscribe_calls("garage"), 1);
}

#[tokio::test]
async fn test_events_are_stored_and_notified() {
    let mut harness = Harness::new();
    let run = harness.start().await;

    let event = serde_json::json!({
        "id": "frontdoor",
        "message": "door opened",
        "priority": 1,
        "time": "2024-03-01T10:00:00Z",
        "battery": 80
    });
    harness
        .bus
        .inject("events", serde_json::to_vec(&event).unwrap())
        .await
        .unwrap();
    let silent = serde_json::json!({"id": "frontdoor", "priority": 0, "time": "2024-03-01T10:01:00Z"});
    harness
        .bus
        .inject("events", serde_json::to_vec(&silent).unwrap())
        .await
        .unwrap();

    harness.bus.close();
    run.await.unwrap().unwrap();

    let events = harness.store.last_events("frontdoor", 10).unwrap();
    assert_eq!(events.len(), 2);
    let opened = events.iter().find(|e| e.message == "door opened").unwrap();
    assert_eq!(opened.extra.get("battery"), Some(&serde_json::json!(80)));

    let notices = Arc::clone(&harness.notices);
    wait_until(|| notices.0.lock().iter().any(|n| matches!(n, Notice::Event(_)))).await;
    let notices = harness.notices.0.lock().clone();
    let rendered: Vec<String> = notices
        .iter()
        .filter(|n| matches!(n, Notice::Event(_)))
        .map(ToString::to_string)
        .collect();
    assert_eq!(rendered, vec!["⚠️ [2024-03-01T10:00:00Z] door opened"]);
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::Activity(line) if line.starts_with("[events]"))));
}

#[tokio::test]
async fn test_malformed_payloads_are_dropped() {
    let mut harness = Harness::new();
    let run = harness.start().await;

    harness.bus.inject("discovery", discovery("d1")).await.unwrap();
    let bus = harness.bus.clone();
    wait_until(|| bus.is_subscribed("d1")).await;

    harness.bus.inject("discovery", b"{not json".to_vec()).await.unwrap();
    harness.bus.inject("events", b"[1,2,3]".to_vec()).await.unwrap();
    harness.bus.inject("d1", b"garbage".to_vec()).await.unwrap();
    harness
        .bus
        .inject("d1", br#"[{"id":"temp","value":1,"time":"2024-03-01T10:00:00Z"}]"#.to_vec())
        .await
        .unwrap();

    harness.bus.close();
    run.await.unwrap().unwrap();

    assert_eq!(harness.store.list_devices().unwrap().len(), 1);
    assert_eq!(harness.store.all_values("d1", "temp").unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsubscribed_topic_is_ignored() {
    let harness = Harness::new();
    harness
        .manager
        .dispatch(BusMessage::new(
            "ghost",
            br#"[{"id":"temp","value":1,"time":"2024-03-01T10:00:00Z"}]"#.to_vec(),
        ))
        .await
        .unwrap();
    assert!(harness.store.all_values("ghost", "temp").unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_subscription_stops_ingestion() {
    let mut harness = Harness::new();
    harness.bus.fail_subscribe("broken");
    let run = harness.start().await;

    harness.bus.inject("discovery", discovery("broken")).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not stop")
        .unwrap();
    match result {
        Err(IngestError::Subscribe { topic, .. }) => assert_eq!(topic, "broken"),
        other => panic!("expected subscribe failure, got {other:?}"),
    }
    assert_eq!(
        harness.manager.subscriptions().state("broken"),
        SubscriptionState::SubscribeFailed
    );
}

#[tokio::test]
async fn test_failed_restore_is_fatal_at_startup() {
    let harness = Harness::new();
    let device: Device = serde_json::from_slice(&discovery("cellar")).unwrap();
    harness.store.upsert_device(&device).unwrap();
    harness.bus.fail_subscribe("cellar");

    let err = harness.manager.start().await.unwrap_err();
    assert!(matches!(err, IngestError::Subscribe { .. }));
    assert_eq!(harness.bus.subscribe_calls("discovery"), 0);
}
