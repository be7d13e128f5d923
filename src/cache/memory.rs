//! In-process [`CacheStore`] with TTL expiry.
//!
//! An expired key is dropped when it is next touched. Keys that are never
//! touched again (negative markers for unknown sites, past days' windows)
//! are reclaimed by a full sweep every [`SWEEP_EVERY`] writes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use anyhow::{bail, Result};

use super::CacheStore;

// ---

/// Writes between two sweeps of expired entries.
pub const SWEEP_EVERY: u64 = 256;

enum Value {
    Text(String),
    Sorted(BTreeSet<(i64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    failure: RwLock<Option<String>>,
    writes: AtomicU64,
}

impl MemoryCache {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `reason` until cleared.
    pub fn fail(&self, reason: Option<&str>) {
        *self.failure.write() = reason.map(str::to_string);
    }

    fn check(&self) -> Result<()> {
        if let Some(reason) = self.failure.read().as_deref() {
            bail!("{reason}");
        }
        Ok(())
    }

    /// Keys currently held, live or not yet swept.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        // ---
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "expired cache entries swept");
        }
        removed
    }

    /// Must not be called while holding a reference into `entries`.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    // ---
    async fn get(&self, key: &str) -> Result<Option<String>> {
        // ---
        self.check()?;
        self.evict_if_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            Value::Sorted(_) => bail!("WRONGTYPE {key} holds a sorted set"),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        // ---
        self.check()?;
        self.note_write();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // ---
        self.check()?;
        self.note_write();
        let now = Instant::now();
        let entry = Entry {
            value: Value::Text(value.to_string()),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Slot::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(entry);
            }
            Slot::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(true)
    }

    async fn zadd_bounded(
        &self,
        key: &str,
        score: i64,
        member: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<usize> {
        // ---
        self.check()?;
        self.note_write();
        self.evict_if_expired(key);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(BTreeSet::new()),
            expires_at: Instant::now() + ttl,
        });
        let Value::Sorted(set) = &mut entry.value else {
            bail!("WRONGTYPE {key} holds a string");
        };

        set.retain(|(_, m)| m != member);
        set.insert((score, member.to_string()));
        while set.len() > max_len {
            set.pop_first();
        }
        let size = set.len();
        entry.expires_at = Instant::now() + ttl;
        Ok(size)
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        // ---
        self.check()?;
        self.evict_if_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(set) = &entry.value else {
            bail!("WRONGTYPE {key} holds a string");
        };
        Ok(set
            .iter()
            .filter(|(score, _)| (min..=max).contains(score))
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zmin_score(&self, key: &str) -> Result<Option<i64>> {
        // ---
        self.check()?;
        self.evict_if_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        let Value::Sorted(set) = &entry.value else {
            bail!("WRONGTYPE {key} holds a string");
        };
        Ok(set.first().map(|(score, _)| *score))
    }
}
