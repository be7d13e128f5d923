//! Persistence consumer on `reading-events`.
//!
//! Stores each reading in the system of record, then writes it through to the
//! cache and pushes a DATA envelope. Only the store write can fail the record;
//! cache and push are best effort.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    Envelope, HandlerError, PipelineError, PushHub, Reading, Record, RecordHandler, Store,
    TelemetryCache,
};

// ---

pub struct PersistenceConsumer {
    store: Arc<dyn Store>,
    cache: TelemetryCache,
    push: PushHub,
}

impl PersistenceConsumer {
    pub fn new(store: Arc<dyn Store>, cache: TelemetryCache, push: PushHub) -> Self {
        Self { store, cache, push }
    }
}

#[async_trait]
impl RecordHandler for PersistenceConsumer {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        // ---
        let reading: Reading = serde_json::from_str(&record.payload)?;

        self.store
            .insert_reading(&reading)
            .await
            .map_err(PipelineError::storage)?;
        debug!(
            site_id = reading.site_id,
            partition = record.partition,
            offset = record.offset,
            "reading stored"
        );

        self.cache.write_through(&reading).await;

        match Envelope::data(&reading) {
            Ok(envelope) => {
                self.push.publish(reading.site_id, envelope);
            }
            Err(e) => warn!(site_id = reading.site_id, "could not encode reading: {e}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{CacheSettings, EventKind, MemoryCache, MemoryStore};
    use chrono::Utc;

    fn create_test_record(payload: &str) -> Record {
        Record {
            topic: "reading-events".to_string(),
            partition: 0,
            offset: 7,
            key: "5".to_string(),
            payload: payload.to_string(),
            headers: Default::default(),
            published_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, PushHub, PersistenceConsumer) {
        // ---
        let store = Arc::new(MemoryStore::new());
        let cache = TelemetryCache::new(
            Arc::new(MemoryCache::new()),
            store.clone(),
            CacheSettings::default(),
        );
        let push = PushHub::new(8);
        let consumer = PersistenceConsumer::new(store.clone(), cache, push.clone());
        (store, push, consumer)
    }

    #[tokio::test]
    async fn test_reading_is_stored_and_pushed() {
        // ---
        let (store, push, consumer) = setup();
        let mut viewer = push.subscribe(5);
        let payload = r#"{"site_id":5,"temperature":23.5,"timestamp":"2025-02-01T10:00:00Z","source":"SENSOR"}"#;

        consumer.handle(&create_test_record(payload)).await.unwrap();

        assert_eq!(store.reading_count(), 1);
        let envelope = viewer.try_recv().unwrap();
        assert_eq!(envelope.kind, EventKind::Data);
        assert_eq!(envelope.payload["temperature"], 23.5);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_poison() {
        // ---
        let (store, _push, consumer) = setup();
        let err = consumer.handle(&create_test_record("{not json")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));
        assert_eq!(store.reading_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_transient() {
        // ---
        let (store, _push, consumer) = setup();
        store.fail_writes(Some("database is down"));
        let payload = r#"{"site_id":5,"timestamp":"2025-02-01T10:00:00Z","source":"SENSOR"}"#;

        let err = consumer.handle(&create_test_record(payload)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Transient(_)));
    }
}
