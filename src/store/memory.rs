//! In-process [`Store`] implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use anyhow::{bail, Result};

use super::Store;
use crate::{Alarm, AlarmStatus, DailyAggregate, Reading, SiteId};

// ---

/// Readings are kept per site ordered by `(timestamp, insertion sequence)`,
/// so equal timestamps never overwrite each other.
#[derive(Default)]
pub struct MemoryStore {
    readings: DashMap<SiteId, RwLock<BTreeMap<(DateTime<Utc>, u64), Reading>>>,
    sequence: AtomicU64,
    alarms: DashMap<Uuid, Alarm>,
    aggregates: DashMap<(SiteId, NaiveDate), DailyAggregate>,
    reading_lookups: AtomicU64,
    fail_writes: RwLock<Option<String>>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `latest_reading`/`readings_between` calls served.
    pub fn reading_lookups(&self) -> u64 {
        self.reading_lookups.load(Ordering::Relaxed)
    }

    pub fn reading_count(&self) -> usize {
        let mut total = 0;
        for site in self.readings.iter() {
            total += site.value().read().len();
        }
        total
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.iter().map(|a| a.value().clone()).collect()
    }

    /// Make every write fail with `reason` until cleared with `None`.
    pub fn fail_writes(&self, reason: Option<&str>) {
        *self.fail_writes.write() = reason.map(str::to_string);
    }

    fn check_writable(&self) -> Result<()> {
        if let Some(reason) = self.fail_writes.read().as_deref() {
            bail!("{reason}");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ---
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        // ---
        self.check_writable()?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.readings
            .entry(reading.site_id)
            .or_default()
            .write()
            .insert((reading.timestamp, seq), reading.clone());
        Ok(())
    }

    async fn latest_reading(&self, site_id: SiteId) -> Result<Option<Reading>> {
        // ---
        self.reading_lookups.fetch_add(1, Ordering::Relaxed);
        let Some(site) = self.readings.get(&site_id) else {
            return Ok(None);
        };
        let latest = site.read().values().next_back().cloned();
        Ok(latest)
    }

    async fn readings_between(
        &self,
        site_id: SiteId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        // ---
        self.reading_lookups.fetch_add(1, Ordering::Relaxed);
        if from > to {
            return Ok(Vec::new());
        }
        let Some(site) = self.readings.get(&site_id) else {
            return Ok(Vec::new());
        };
        let window = site
            .read()
            .range((from, 0)..=(to, u64::MAX))
            .map(|(_, r)| r.clone())
            .collect();
        Ok(window)
    }

    async fn insert_alarm(&self, alarm: &Alarm) -> Result<bool> {
        // ---
        self.check_writable()?;
        match self.alarms.entry(alarm.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(alarm.clone());
                Ok(true)
            }
        }
    }

    async fn get_alarm(&self, id: Uuid) -> Result<Option<Alarm>> {
        Ok(self.alarms.get(&id).map(|a| a.value().clone()))
    }

    async fn update_alarm(&self, alarm: &Alarm, expected: AlarmStatus) -> Result<bool> {
        // ---
        self.check_writable()?;
        let Some(mut stored) = self.alarms.get_mut(&alarm.id) else {
            return Ok(false);
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = alarm.clone();
        Ok(true)
    }

    async fn daily_aggregate(
        &self,
        site_id: SiteId,
        day: NaiveDate,
    ) -> Result<Option<DailyAggregate>> {
        Ok(self.aggregates.get(&(site_id, day)).map(|a| a.value().clone()))
    }

    async fn upsert_daily_aggregate(&self, aggregate: &DailyAggregate) -> Result<()> {
        // ---
        self.check_writable()?;
        self.aggregates
            .insert((aggregate.site_id, aggregate.stat_date), aggregate.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn create_test_reading(site_id: SiteId, timestamp: DateTime<Utc>, temperature: f64) -> Reading {
        // ---
        Reading {
            site_id,
            site_name: None,
            temperature: Some(temperature),
            humidity: None,
            pm25: None,
            illuminance: None,
            co2: None,
            online_device_count: None,
            total_device_count: None,
            occupancy: None,
            timestamp,
            source: "SENSOR".to_string(),
            alarm_status: None,
            remark: None,
        }
    }

    #[tokio::test]
    async fn test_latest_is_by_timestamp_not_insertion_order() {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap();

        store.insert_reading(&create_test_reading(1, t0 + Duration::minutes(5), 25.0)).await.unwrap();
        store.insert_reading(&create_test_reading(1, t0, 20.0)).await.unwrap();

        let latest = store.latest_reading(1).await.unwrap().unwrap();
        assert_eq!(latest.temperature, Some(25.0));
        assert!(store.latest_reading(2).await.unwrap().is_none());
        assert_eq!(store.reading_lookups(), 2);
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_ascending() {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap();
        for i in 0..5 {
            store
                .insert_reading(&create_test_reading(1, t0 + Duration::minutes(i), i as f64))
                .await
                .unwrap();
        }

        let window = store
            .readings_between(1, t0 + Duration::minutes(1), t0 + Duration::minutes(3))
            .await
            .unwrap();
        let temps: Vec<f64> = window.iter().filter_map(|r| r.temperature).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);

        let empty = store.readings_between(1, t0 + Duration::minutes(3), t0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_failing_writes_report_errors() {
        // ---
        let store = MemoryStore::new();
        store.fail_writes(Some("disk full"));
        let err = store
            .insert_reading(&create_test_reading(1, Utc::now(), 20.0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");

        store.fail_writes(None);
        assert!(store.insert_reading(&create_test_reading(1, Utc::now(), 20.0)).await.is_ok());
    }
}
