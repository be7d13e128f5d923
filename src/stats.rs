//! Statistics aggregator consumer on `reading-events`.
//!
//! Folding a reading into a [`DailyAggregate`] is a read-modify-write, so
//! updates are serialized per `(site, day)` with an async mutex. The current
//! aggregate is always read from the store, not the cache, so a stale cache
//! entry can never cause a lost update.
//!
//! Delivery is at-least-once and folding is not idempotent: a redelivered
//! reading is counted again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::{
    DailyAggregate, Envelope, HandlerError, PipelineError, PushHub, Reading, Record,
    RecordHandler, SiteId, Store, TelemetryCache,
};

// ---

type DayKey = (SiteId, NaiveDate);

pub struct StatisticsAggregator {
    store: Arc<dyn Store>,
    cache: TelemetryCache,
    push: PushHub,
    locks: DashMap<DayKey, Arc<AsyncMutex<()>>>,
    newest_day: Mutex<Option<NaiveDate>>,
}

impl StatisticsAggregator {
    // ---
    pub fn new(store: Arc<dyn Store>, cache: TelemetryCache, push: PushHub) -> Self {
        Self {
            store,
            cache,
            push,
            locks: DashMap::new(),
            newest_day: Mutex::new(None),
        }
    }

    fn lock_for(&self, key: DayKey) -> Arc<AsyncMutex<()>> {
        // ---
        {
            let mut newest = self.newest_day.lock();
            if newest.map_or(true, |day| key.1 > day) {
                *newest = Some(key.1);
                // Locks of days before yesterday are dropped unless in use
                let keep_from = key.1.pred_opt().unwrap_or(key.1);
                self.locks
                    .retain(|(_, day), lock| *day >= keep_from || Arc::strong_count(lock) > 1);
            }
        }
        self.locks.entry(key).or_default().clone()
    }

    /// Fold `reading` into its day's aggregate, persist it, refresh the cache
    /// and push a STAT envelope to the site's subscribers.
    pub async fn record(&self, reading: &Reading) -> Result<DailyAggregate, PipelineError> {
        // ---
        let (site_id, day) = (reading.site_id, reading.day());
        let lock = self.lock_for((site_id, day));
        let _guard = lock.lock().await;

        let now = Utc::now();
        let aggregate = match self
            .store
            .daily_aggregate(site_id, day)
            .await
            .map_err(PipelineError::storage)?
        {
            Some(mut aggregate) => {
                aggregate.fold(reading, now);
                aggregate
            }
            None => {
                debug!(site_id, %day, "seeding daily aggregate");
                DailyAggregate::seed(reading, now)
            }
        };

        self.store
            .upsert_daily_aggregate(&aggregate)
            .await
            .map_err(PipelineError::storage)?;
        self.cache.put_aggregate(&aggregate).await;

        match Envelope::stat(&aggregate) {
            Ok(envelope) => {
                self.push.publish(site_id, envelope);
            }
            Err(e) => warn!(site_id, "could not encode aggregate: {e}"),
        }

        debug!(site_id, %day, count = aggregate.count, "daily aggregate updated");
        Ok(aggregate)
    }

    /// Aggregate of `site_id` for `day`, through the cache.
    pub async fn get(
        &self,
        site_id: SiteId,
        day: NaiveDate,
    ) -> Result<Option<DailyAggregate>, PipelineError> {
        self.cache.get_aggregate(site_id, day).await
    }
}

#[async_trait]
impl RecordHandler for StatisticsAggregator {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let reading: Reading = serde_json::from_str(&record.payload)?;
        self.record(&reading).await?;
        Ok(())
    }
}
