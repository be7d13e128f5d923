//! System of record.
//!
//! The pipeline only needs plain create/read/update operations from storage.
//! [`Store`] is the seam; [`PgStore`] backs it with PostgreSQL through sqlx,
//! [`MemoryStore`] keeps everything in process for tests and for running
//! without a database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use anyhow::Result;

use crate::{Alarm, AlarmStatus, DailyAggregate, Reading, SiteId};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ---
    async fn insert_reading(&self, reading: &Reading) -> Result<()>;

    /// Most recent reading of `site_id` by reading timestamp.
    async fn latest_reading(&self, site_id: SiteId) -> Result<Option<Reading>>;

    /// Readings with `from <= timestamp <= to`, ascending.
    async fn readings_between(
        &self,
        site_id: SiteId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Returns `false` when an alarm with the same id already exists, which
    /// makes redelivered alarm events harmless.
    async fn insert_alarm(&self, alarm: &Alarm) -> Result<bool>;

    async fn get_alarm(&self, id: Uuid) -> Result<Option<Alarm>>;

    /// Overwrite `alarm` only if its stored status is still `expected`.
    /// Returns `false` when another writer got there first.
    async fn update_alarm(&self, alarm: &Alarm, expected: AlarmStatus) -> Result<bool>;

    async fn daily_aggregate(&self, site_id: SiteId, day: NaiveDate)
        -> Result<Option<DailyAggregate>>;

    async fn upsert_daily_aggregate(&self, aggregate: &DailyAggregate) -> Result<()>;
}
