//! Cache layer over the system of record.
//!
//! Three shapes are kept per site:
//! - `env:latest:{site}`: the latest reading, read-through with a TTL
//! - `env:history:{site}:{yyyymmdd}`: a score-ordered window of the day's
//!   readings, write-through and trimmed to the newest N on every insert
//! - `env:stats:daily:{site}:{yyyymmdd}`: the day's aggregate, read-through
//!
//! A miss that the store cannot answer either is remembered with
//! [`NULL_MARKER`] for a short TTL so repeated lookups for unknown sites never
//! reach the store. Cache failures are logged and degrade to direct store
//! access; they never fail the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use anyhow::Result;

use crate::{DailyAggregate, PipelineError, Reading, SiteId, Store};

mod memory;
mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

// ---

/// Value stored under a key whose lookup found nothing.
pub const NULL_MARKER: &str = "NULL_VALUE";

/// Minimal key/value plus sorted-set surface the cache layer needs.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    // ---
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Like [`set`](Self::set) but only when `key` holds no live value.
    /// Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Add `member` with `score`, keep only the `max_len` highest scores and
    /// refresh the TTL. Returns the resulting size.
    async fn zadd_bounded(
        &self,
        key: &str,
        score: i64,
        member: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>>;

    /// Lowest score in the set, `None` if the key does not exist.
    async fn zmin_score(&self, key: &str) -> Result<Option<i64>>;
}

pub type CacheBackend = Arc<dyn CacheStore>;

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// A negative marker is live: the store has nothing for this key.
    Negative,
    Miss,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub latest_ttl: Duration,
    pub history_ttl: Duration,
    pub history_max_entries: usize,
    pub negative_ttl: Duration,
    pub stats_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            latest_ttl: Duration::from_secs(30),
            history_ttl: Duration::from_secs(600),
            history_max_entries: 1000,
            negative_ttl: Duration::from_secs(60),
            stats_ttl: Duration::from_secs(3600),
        }
    }
}

pub fn latest_key(site_id: SiteId) -> String {
    format!("env:latest:{site_id}")
}

pub fn history_key(site_id: SiteId, day: NaiveDate) -> String {
    format!("env:history:{site_id}:{}", day.format("%Y%m%d"))
}

pub fn stats_key(site_id: SiteId, day: NaiveDate) -> String {
    format!("env:stats:daily:{site_id}:{}", day.format("%Y%m%d"))
}

/// Cache policy in front of a [`Store`].
#[derive(Clone)]
pub struct TelemetryCache {
    backend: CacheBackend,
    store: Arc<dyn Store>,
    settings: CacheSettings,
}

impl TelemetryCache {
    // ---
    pub fn new(backend: CacheBackend, store: Arc<dyn Store>, settings: CacheSettings) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    async fn probe<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        // ---
        match self.backend.get(key).await {
            Ok(None) => Lookup::Miss,
            Ok(Some(raw)) if raw == NULL_MARKER => Lookup::Negative,
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Lookup::Hit(value),
                Err(e) => {
                    warn!(key, "discarding undecodable cache entry: {e}");
                    Lookup::Miss
                }
            },
            Err(e) => {
                warn!(key, "cache read failed, falling back to store: {e:#}");
                Lookup::Miss
            }
        }
    }

    /// Cache what a miss loaded from the store, or the negative marker.
    /// Never replaces an entry written meanwhile by a write-through, since
    /// that one is at least as fresh as the store read.
    async fn fill<T: serde::Serialize>(&self, key: &str, value: Option<&T>, ttl: Duration) {
        // ---
        let result = match value {
            Some(value) => match serde_json::to_string(value) {
                Ok(json) => self.backend.set_if_absent(key, &json, ttl).await,
                Err(e) => {
                    warn!(key, "could not encode cache entry: {e}");
                    return;
                }
            },
            None => {
                self.backend
                    .set_if_absent(key, NULL_MARKER, self.settings.negative_ttl)
                    .await
            }
        };
        match result {
            Ok(true) => {}
            Ok(false) => debug!(key, "entry written concurrently, keeping it"),
            Err(e) => warn!(key, "cache write failed: {e:#}"),
        }
    }

    /// Latest reading of `site_id`.
    ///
    /// A live negative marker answers `None` without touching the store; a
    /// miss loads from the store and caches either the reading or the marker.
    pub async fn get_latest(&self, site_id: SiteId) -> Result<Option<Reading>, PipelineError> {
        // ---
        let key = latest_key(site_id);
        match self.probe::<Reading>(&key).await {
            Lookup::Hit(reading) => {
                debug!(site_id, "latest cache hit");
                return Ok(Some(reading));
            }
            Lookup::Negative => {
                debug!(site_id, "latest negative cache hit");
                return Ok(None);
            }
            Lookup::Miss => {}
        }

        let reading = self
            .store
            .latest_reading(site_id)
            .await
            .map_err(PipelineError::storage)?;
        self.fill(&key, reading.as_ref(), self.settings.latest_ttl).await;
        Ok(reading)
    }

    /// Readings of `site_id` with `from <= timestamp <= to`, ascending.
    ///
    /// Same-day ranges come from the history window when it covers `from`;
    /// cross-day ranges and uncovered ranges go to the store.
    pub async fn get_window(
        &self,
        site_id: SiteId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, PipelineError> {
        // ---
        if from > to {
            return Ok(Vec::new());
        }

        if from.date_naive() == to.date_naive() {
            if let Some(window) = self.cached_window(site_id, from, to).await {
                debug!(site_id, entries = window.len(), "history window served from cache");
                return Ok(window);
            }
        }

        self.store
            .readings_between(site_id, from, to)
            .await
            .map_err(PipelineError::storage)
    }

    async fn cached_window(
        &self,
        site_id: SiteId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<Vec<Reading>> {
        // ---
        let key = history_key(site_id, from.date_naive());
        let (from_ms, to_ms) = (from.timestamp_millis(), to.timestamp_millis());

        let oldest = match self.backend.zmin_score(&key).await {
            Ok(oldest) => oldest?,
            Err(e) => {
                warn!(key, "history window read failed, falling back to store: {e:#}");
                return None;
            }
        };
        // The window only answers ranges it fully covers
        if oldest > from_ms {
            return None;
        }

        let members = match self.backend.zrange_by_score(&key, from_ms, to_ms).await {
            Ok(members) => members,
            Err(e) => {
                warn!(key, "history window read failed, falling back to store: {e:#}");
                return None;
            }
        };

        let mut window = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<Reading>(&member) {
                Ok(reading) => window.push(reading),
                Err(e) => {
                    warn!(key, "undecodable history entry, falling back to store: {e}");
                    return None;
                }
            }
        }
        Some(window)
    }

    /// Refresh the latest entry (unless the cached one is newer) and append
    /// to the day's history window. Best effort.
    pub async fn write_through(&self, reading: &Reading) {
        // ---
        let json = match serde_json::to_string(reading) {
            Ok(json) => json,
            Err(e) => {
                warn!(site_id = reading.site_id, "could not encode reading for cache: {e}");
                return;
            }
        };

        let key = latest_key(reading.site_id);
        let newer_cached = match self.probe::<Reading>(&key).await {
            Lookup::Hit(cached) => cached.timestamp > reading.timestamp,
            Lookup::Negative | Lookup::Miss => false,
        };
        if !newer_cached {
            if let Err(e) = self.backend.set(&key, &json, self.settings.latest_ttl).await {
                warn!(key, "cache write failed: {e:#}");
            }
        }

        let key = history_key(reading.site_id, reading.day());
        if let Err(e) = self
            .backend
            .zadd_bounded(
                &key,
                reading.timestamp.timestamp_millis(),
                &json,
                self.settings.history_max_entries,
                self.settings.history_ttl,
            )
            .await
        {
            warn!(key, "history window write failed: {e:#}");
        }
    }

    /// Daily aggregate of `site_id` for `day`, read-through with negative
    /// caching like [`get_latest`](Self::get_latest).
    pub async fn get_aggregate(
        &self,
        site_id: SiteId,
        day: NaiveDate,
    ) -> Result<Option<DailyAggregate>, PipelineError> {
        // ---
        let key = stats_key(site_id, day);
        match self.probe::<DailyAggregate>(&key).await {
            Lookup::Hit(aggregate) => return Ok(Some(aggregate)),
            Lookup::Negative => return Ok(None),
            Lookup::Miss => {}
        }

        let aggregate = self
            .store
            .daily_aggregate(site_id, day)
            .await
            .map_err(PipelineError::storage)?;
        self.fill(&key, aggregate.as_ref(), self.settings.stats_ttl).await;
        Ok(aggregate)
    }

    pub async fn put_aggregate(&self, aggregate: &DailyAggregate) {
        // ---
        let key = stats_key(aggregate.site_id, aggregate.stat_date);
        let json = match serde_json::to_string(aggregate) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, "could not encode aggregate for cache: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.set(&key, &json, self.settings.stats_ttl).await {
            warn!(key, "cache write failed: {e:#}");
        }
    }
}
