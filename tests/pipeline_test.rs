//! End-to-end pipeline behavior over the in-memory store and cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use envpulse::{
    AlarmType, EventKind, Envelope, MemoryCache, MemoryStore, Pipeline, PipelineSettings,
    RawReading, Reading, RetryPolicy, Severity, SiteId, ALARM_DLQ, READING_DLQ, READING_EVENTS,
};

// ---

const IDLE: Duration = Duration::from_secs(5);

fn create_test_pipeline() -> (Pipeline, Arc<MemoryStore>) {
    // ---
    let store = Arc::new(MemoryStore::new());
    let settings = PipelineSettings {
        retry: RetryPolicy {
            max_retries: 1,
            initial: Duration::from_millis(5),
            multiplier: 2.0,
            max: Duration::from_millis(20),
        },
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::start(settings, store.clone(), Arc::new(MemoryCache::new()));
    (pipeline, store)
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
}

fn create_test_raw(site_id: SiteId, temperature: f64, timestamp: DateTime<Utc>) -> RawReading {
    RawReading {
        site_id: Some(site_id),
        site_name: Some(format!("Lab {site_id}")),
        temperature: Some(temperature),
        humidity: Some(50.0),
        timestamp: Some(timestamp),
        ..RawReading::default()
    }
}

fn temperature_alarms(store: &MemoryStore, site_id: SiteId) -> Vec<(AlarmType, Severity)> {
    store
        .alarms()
        .into_iter()
        .filter(|a| a.site_id == site_id)
        .map(|a| (a.alarm_type, a.severity))
        .collect()
}

#[tokio::test]
async fn test_temperature_above_critical_raises_single_danger_alarm() {
    // ---
    let (pipeline, store) = create_test_pipeline();

    pipeline
        .producer()
        .submit(create_test_raw(1, 36.0, at(9, 0)))
        .await
        .unwrap();
    assert!(pipeline.wait_idle(IDLE).await);

    assert_eq!(
        temperature_alarms(&store, 1),
        vec![(AlarmType::TempHigh, Severity::Danger)]
    );
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_temperature_in_warning_band_raises_single_warning_alarm() {
    // ---
    let (pipeline, store) = create_test_pipeline();

    for (site_id, temperature) in [(2, 28.1), (3, 30.0), (4, 35.0)] {
        pipeline
            .producer()
            .submit(create_test_raw(site_id, temperature, at(9, 0)))
            .await
            .unwrap();
    }
    assert!(pipeline.wait_idle(IDLE).await);

    for site_id in [2, 3, 4] {
        assert_eq!(
            temperature_alarms(&store, site_id),
            vec![(AlarmType::TempHigh, Severity::Warning)],
            "site {site_id}"
        );
    }
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_first_reading_seeds_daily_aggregate() {
    // ---
    let (pipeline, _store) = create_test_pipeline();

    pipeline
        .producer()
        .submit(create_test_raw(10, 20.0, at(8, 0)))
        .await
        .unwrap();
    assert!(pipeline.wait_idle(IDLE).await);

    let aggregate = pipeline
        .statistics()
        .get(10, at(8, 0).date_naive())
        .await
        .unwrap()
        .expect("aggregate for site 10");
    let temperature = aggregate.metrics.temperature.unwrap();
    let humidity = aggregate.metrics.humidity.unwrap();

    assert_eq!(aggregate.count, 1);
    assert_eq!((temperature.avg, temperature.min, temperature.max), (20.0, 20.0, 20.0));
    assert_eq!((humidity.avg, humidity.min, humidity.max), (50.0, 50.0, 50.0));
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_two_readings_fold_incremental_average() {
    // ---
    let (pipeline, _store) = create_test_pipeline();

    pipeline
        .producer()
        .submit_batch(vec![
            create_test_raw(11, 20.0, at(8, 0)),
            create_test_raw(11, 30.0, at(8, 5)),
        ])
        .await
        .unwrap();
    assert!(pipeline.wait_idle(IDLE).await);

    let aggregate = pipeline
        .statistics()
        .get(11, at(8, 0).date_naive())
        .await
        .unwrap()
        .unwrap();
    let temperature = aggregate.metrics.temperature.unwrap();

    assert_eq!(aggregate.count, 2);
    assert!((temperature.avg - 25.0).abs() < 1e-9);
    assert_eq!((temperature.min, temperature.max), (20.0, 30.0));
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_unknown_site_latest_is_negatively_cached() {
    // ---
    let (pipeline, store) = create_test_pipeline();

    assert!(pipeline.cache().get_latest(404).await.unwrap().is_none());
    assert_eq!(store.reading_lookups(), 1);

    assert!(pipeline.cache().get_latest(404).await.unwrap().is_none());
    assert_eq!(store.reading_lookups(), 1, "second lookup must be served by the cache");
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_malformed_record_is_dead_lettered_and_stream_keeps_flowing() {
    // ---
    let (pipeline, store) = create_test_pipeline();

    pipeline
        .bus()
        .publish(READING_EVENTS, "20", "{not json".to_string())
        .await
        .unwrap();
    pipeline
        .producer()
        .submit(create_test_raw(20, 22.0, at(10, 0)))
        .await
        .unwrap();
    assert!(pipeline.wait_idle(IDLE).await);

    let dead = pipeline.bus().read(READING_DLQ, 10);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, "{not json");
    assert_eq!(dead[0].headers["x-original-topic"], READING_EVENTS);
    assert_eq!(dead[0].headers["x-consumer-group"], "reading-persistence-group");
    assert_eq!(pipeline.bus().read(ALARM_DLQ, 10).len(), 1);

    assert_eq!(store.reading_count(), 1);
    let latest = pipeline.cache().get_latest(20).await.unwrap().unwrap();
    assert_eq!(latest.temperature, Some(22.0));
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_push_is_isolated_per_site_and_broadcast_reaches_all() {
    // ---
    let (pipeline, _store) = create_test_pipeline();
    let mut site_a = pipeline.push().subscribe(30);
    let mut site_b = pipeline.push().subscribe(31);

    pipeline
        .producer()
        .submit(create_test_raw(31, 22.0, at(11, 0)))
        .await
        .unwrap();
    assert!(pipeline.wait_idle(IDLE).await);

    assert!(site_a.try_recv().is_none(), "site 30 must not see site 31 events");
    let mut kinds = Vec::new();
    while let Some(envelope) = site_b.try_recv() {
        assert_eq!(envelope.site_id, Some(31));
        kinds.push(envelope.kind);
    }
    assert!(kinds.contains(&EventKind::Data));
    assert!(kinds.contains(&EventKind::Stat));

    let delivery = pipeline
        .push()
        .broadcast(Envelope::system("maintenance at 22:00", None));
    assert_eq!(delivery.delivered, 2);
    assert_eq!(site_a.try_recv().unwrap().kind, EventKind::System);
    assert_eq!(site_b.try_recv().unwrap().kind, EventKind::System);
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_redelivered_reading_is_counted_twice() {
    // ---
    let (pipeline, _store) = create_test_pipeline();
    let reading: Reading = create_test_raw(40, 21.0, at(12, 0))
        .into_reading(Utc::now())
        .unwrap();
    let payload = serde_json::to_string(&reading).unwrap();

    for _ in 0..2 {
        pipeline
            .bus()
            .publish(READING_EVENTS, "40", payload.clone())
            .await
            .unwrap();
    }
    assert!(pipeline.wait_idle(IDLE).await);

    let aggregate = pipeline
        .statistics()
        .get(40, reading.day())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.count, 2);
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_redelivered_reading_records_alarm_once() {
    // ---
    let (pipeline, store) = create_test_pipeline();
    let reading: Reading = create_test_raw(41, 36.0, at(12, 30))
        .into_reading(Utc::now())
        .unwrap();
    let payload = serde_json::to_string(&reading).unwrap();

    for _ in 0..2 {
        pipeline
            .bus()
            .publish(READING_EVENTS, "41", payload.clone())
            .await
            .unwrap();
    }
    assert!(pipeline.wait_idle(IDLE).await);

    assert_eq!(
        temperature_alarms(&store, 41),
        vec![(AlarmType::TempHigh, Severity::Danger)]
    );
    pipeline.shutdown(IDLE).await;
}

#[tokio::test]
async fn test_shutdown_stops_consumers_and_rejects_publishes() {
    // ---
    let (pipeline, _store) = create_test_pipeline();
    assert!(pipeline.is_running());

    pipeline.shutdown(IDLE).await;
    assert!(!pipeline.is_running());
    assert!(pipeline.status().groups.is_empty());

    let result = pipeline
        .producer()
        .submit(create_test_raw(50, 21.0, at(12, 0)))
        .await;
    assert!(result.is_err());

    // idempotent
    pipeline.shutdown(IDLE).await;
}
