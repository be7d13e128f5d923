//! PostgreSQL [`Store`] implementation over a sqlx pool.
//!
//! Tables are created by `schema::create_schema`. Rows are decoded into
//! private `*Row` structs mirroring the column types and converted into the
//! domain models at this boundary.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use anyhow::{anyhow, Context, Result};

use super::Store;
use crate::{Alarm, AlarmStatus, DailyAggregate, MetricSet, Reading, SiteId};

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ReadingRow {
    site_id: i64,
    site_name: Option<String>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pm25: Option<f64>,
    illuminance: Option<f64>,
    co2: Option<f64>,
    online_device_count: Option<i32>,
    total_device_count: Option<i32>,
    occupancy: Option<i32>,
    recorded_at: DateTime<Utc>,
    source: String,
    alarm_status: Option<i16>,
    remark: Option<String>,
}

impl ReadingRow {
    fn into_reading(self) -> Reading {
        // ---
        Reading {
            site_id: self.site_id,
            site_name: self.site_name,
            temperature: self.temperature,
            humidity: self.humidity,
            pm25: self.pm25,
            illuminance: self.illuminance,
            co2: self.co2,
            online_device_count: self.online_device_count.map(|v| v.max(0) as u32),
            total_device_count: self.total_device_count.map(|v| v.max(0) as u32),
            occupancy: self.occupancy.map(|v| v.max(0) as u32),
            timestamp: self.recorded_at,
            source: self.source,
            alarm_status: self.alarm_status.map(|v| v.clamp(0, u8::MAX as i16) as u8),
            remark: self.remark,
        }
    }
}

#[derive(FromRow)]
struct AlarmRow {
    id: Uuid,
    site_id: i64,
    site_name: Option<String>,
    alarm_type: String,
    severity: String,
    message: String,
    observed_value: f64,
    threshold_value: f64,
    raised_at: DateTime<Utc>,
    status: String,
    confirmed_by: Option<String>,
    confirmed_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    ignored_by: Option<String>,
    ignored_at: Option<DateTime<Utc>>,
    remark: Option<String>,
}

impl AlarmRow {
    fn into_alarm(self) -> Result<Alarm> {
        // ---
        Ok(Alarm {
            id: self.id,
            site_id: self.site_id,
            site_name: self.site_name,
            alarm_type: self.alarm_type.parse().map_err(|e: String| anyhow!(e))?,
            severity: self.severity.parse().map_err(|e: String| anyhow!(e))?,
            message: self.message,
            observed_value: self.observed_value,
            threshold_value: self.threshold_value,
            raised_at: self.raised_at,
            status: self.status.parse().map_err(|e: String| anyhow!(e))?,
            confirmed_by: self.confirmed_by,
            confirmed_at: self.confirmed_at,
            resolved_by: self.resolved_by,
            resolved_at: self.resolved_at,
            ignored_by: self.ignored_by,
            ignored_at: self.ignored_at,
            remark: self.remark,
        })
    }
}

#[derive(FromRow)]
struct AggregateRow {
    site_id: i64,
    site_name: Option<String>,
    stat_date: NaiveDate,
    reading_count: i32,
    alarm_count: i32,
    normal_rate: f64,
    metrics: Json<MetricSet>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AggregateRow {
    fn into_aggregate(self) -> DailyAggregate {
        // ---
        DailyAggregate {
            site_id: self.site_id,
            site_name: self.site_name,
            stat_date: self.stat_date,
            count: self.reading_count.max(0) as u32,
            alarm_count: self.alarm_count.max(0) as u32,
            normal_rate: self.normal_rate,
            metrics: self.metrics.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn to_i32(value: Option<u32>) -> Option<i32> {
    value.map(|v| i32::try_from(v).unwrap_or(i32::MAX))
}

const READING_COLUMNS: &str = "site_id, site_name, temperature, humidity, pm25, illuminance, co2, \
     online_device_count, total_device_count, occupancy, recorded_at, source, alarm_status, remark";

const ALARM_COLUMNS: &str = "id, site_id, site_name, alarm_type, severity, message, observed_value, \
     threshold_value, raised_at, status, confirmed_by, confirmed_at, resolved_by, resolved_at, \
     ignored_by, ignored_at, remark";

#[async_trait]
impl Store for PgStore {
    // ---
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO env_readings (
                site_id, site_name, temperature, humidity, pm25, illuminance, co2,
                online_device_count, total_device_count, occupancy,
                recorded_at, source, alarm_status, remark
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(reading.site_id)
        .bind(&reading.site_name)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.pm25)
        .bind(reading.illuminance)
        .bind(reading.co2)
        .bind(to_i32(reading.online_device_count))
        .bind(to_i32(reading.total_device_count))
        .bind(to_i32(reading.occupancy))
        .bind(reading.timestamp)
        .bind(&reading.source)
        .bind(reading.alarm_status.map(i16::from))
        .bind(&reading.remark)
        .execute(&self.pool)
        .await
        .context("insert into env_readings")?;

        Ok(())
    }

    async fn latest_reading(&self, site_id: SiteId) -> Result<Option<Reading>> {
        // ---
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM env_readings WHERE site_id = $1 \
             ORDER BY recorded_at DESC, id DESC LIMIT 1"
        );
        let row: Option<ReadingRow> = sqlx::query_as(&sql)
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await
            .context("select latest env_reading")?;

        Ok(row.map(ReadingRow::into_reading))
    }

    async fn readings_between(
        &self,
        site_id: SiteId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        // ---
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM env_readings \
             WHERE site_id = $1 AND recorded_at BETWEEN $2 AND $3 \
             ORDER BY recorded_at ASC, id ASC"
        );
        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(site_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .context("select env_readings range")?;

        Ok(rows.into_iter().map(ReadingRow::into_reading).collect())
    }

    async fn insert_alarm(&self, alarm: &Alarm) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            INSERT INTO site_alarms (
                id, site_id, site_name, alarm_type, severity, message,
                observed_value, threshold_value, raised_at, status, remark
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(alarm.id)
        .bind(alarm.site_id)
        .bind(&alarm.site_name)
        .bind(alarm.alarm_type.as_str())
        .bind(alarm.severity.as_str())
        .bind(&alarm.message)
        .bind(alarm.observed_value)
        .bind(alarm.threshold_value)
        .bind(alarm.raised_at)
        .bind(alarm.status.as_str())
        .bind(&alarm.remark)
        .execute(&self.pool)
        .await
        .context("insert into site_alarms")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_alarm(&self, id: Uuid) -> Result<Option<Alarm>> {
        // ---
        let sql = format!("SELECT {ALARM_COLUMNS} FROM site_alarms WHERE id = $1");
        let row: Option<AlarmRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("select site_alarm")?;

        row.map(AlarmRow::into_alarm).transpose()
    }

    async fn update_alarm(&self, alarm: &Alarm, expected: AlarmStatus) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE site_alarms SET
                status = $2,
                confirmed_by = $3, confirmed_at = $4,
                resolved_by = $5, resolved_at = $6,
                ignored_by = $7, ignored_at = $8,
                remark = $9
            WHERE id = $1 AND status = $10
            "#,
        )
        .bind(alarm.id)
        .bind(alarm.status.as_str())
        .bind(&alarm.confirmed_by)
        .bind(alarm.confirmed_at)
        .bind(&alarm.resolved_by)
        .bind(alarm.resolved_at)
        .bind(&alarm.ignored_by)
        .bind(alarm.ignored_at)
        .bind(&alarm.remark)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .context("update site_alarms")?;

        Ok(result.rows_affected() == 1)
    }

    async fn daily_aggregate(
        &self,
        site_id: SiteId,
        day: NaiveDate,
    ) -> Result<Option<DailyAggregate>> {
        // ---
        let row: Option<AggregateRow> = sqlx::query_as(
            r#"
            SELECT site_id, site_name, stat_date, reading_count, alarm_count,
                   normal_rate, metrics, created_at, updated_at
            FROM daily_aggregates
            WHERE site_id = $1 AND stat_date = $2
            "#,
        )
        .bind(site_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("select daily_aggregate")?;

        Ok(row.map(AggregateRow::into_aggregate))
    }

    async fn upsert_daily_aggregate(&self, aggregate: &DailyAggregate) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO daily_aggregates (
                site_id, stat_date, site_name, reading_count, alarm_count,
                normal_rate, metrics, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (site_id, stat_date) DO UPDATE SET
                site_name     = EXCLUDED.site_name,
                reading_count = EXCLUDED.reading_count,
                alarm_count   = EXCLUDED.alarm_count,
                normal_rate   = EXCLUDED.normal_rate,
                metrics       = EXCLUDED.metrics,
                updated_at    = EXCLUDED.updated_at
            "#,
        )
        .bind(aggregate.site_id)
        .bind(aggregate.stat_date)
        .bind(&aggregate.site_name)
        .bind(i32::try_from(aggregate.count).unwrap_or(i32::MAX))
        .bind(i32::try_from(aggregate.alarm_count).unwrap_or(i32::MAX))
        .bind(aggregate.normal_rate)
        .bind(Json(&aggregate.metrics))
        .bind(aggregate.created_at)
        .bind(aggregate.updated_at)
        .execute(&self.pool)
        .await
        .context("upsert daily_aggregates")?;

        Ok(())
    }
}
