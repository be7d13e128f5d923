//! Database schema management for `envpulse`.
//!
//! Ensures required tables and indexes exist before the pipeline starts.
//! Applied once on startup from `main.rs` when PostgreSQL is configured.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `env_readings` (system of record for readings), `site_alarms`
/// (alarm lifecycle) and `daily_aggregates` (one running summary per site and
/// day). Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS env_readings (
            id                  BIGSERIAL PRIMARY KEY,
            site_id             BIGINT           NOT NULL,
            site_name           TEXT,
            temperature         DOUBLE PRECISION,
            humidity            DOUBLE PRECISION,
            pm25                DOUBLE PRECISION,
            illuminance         DOUBLE PRECISION,
            co2                 DOUBLE PRECISION,
            online_device_count INTEGER,
            total_device_count  INTEGER,
            occupancy           INTEGER,
            recorded_at         TIMESTAMPTZ      NOT NULL,
            source              TEXT             NOT NULL,
            alarm_status        SMALLINT,
            remark              TEXT,
            created_at          TIMESTAMPTZ      NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS site_alarms (
            id              UUID PRIMARY KEY,
            site_id         BIGINT           NOT NULL,
            site_name       TEXT,
            alarm_type      TEXT             NOT NULL,
            severity        TEXT             NOT NULL,
            message         TEXT             NOT NULL,
            observed_value  DOUBLE PRECISION NOT NULL,
            threshold_value DOUBLE PRECISION NOT NULL,
            raised_at       TIMESTAMPTZ      NOT NULL,
            status          TEXT             NOT NULL,
            confirmed_by    TEXT,
            confirmed_at    TIMESTAMPTZ,
            resolved_by     TEXT,
            resolved_at     TIMESTAMPTZ,
            ignored_by      TEXT,
            ignored_at      TIMESTAMPTZ,
            remark          TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Metrics are stored as one JSONB document per row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_aggregates (
            site_id       BIGINT           NOT NULL,
            stat_date     DATE             NOT NULL,
            site_name     TEXT,
            reading_count INTEGER          NOT NULL,
            alarm_count   INTEGER          NOT NULL,
            normal_rate   DOUBLE PRECISION NOT NULL,
            metrics       JSONB            NOT NULL,
            created_at    TIMESTAMPTZ      NOT NULL,
            updated_at    TIMESTAMPTZ      NOT NULL,
            PRIMARY KEY (site_id, stat_date)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_env_readings_site_time
            ON env_readings (site_id, recorded_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_site_alarms_site_status
            ON site_alarms (site_id, status);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
