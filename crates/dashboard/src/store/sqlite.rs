//! SQLite backend for the persistence gateway.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use super::{
    now_rfc3339, LogPage, NewSensorLog, NewStatusLog, Schedule, SchedulePatch, SensorLog,
    SensorLogQuery, StateMap, StatusLog, StatusLogQuery, Store,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:dashboard.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // A :memory: database exists per connection, so the pool must not
        // grow past one or later queries would see empty tables.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

impl Store for SqliteStore {
    async fn get_state(&self) -> Result<StateMap> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM system_state")
            .fetch_all(&self.pool)
            .await
            .context("get_state failed")?;

        // Values are stored as JSON text; anything unparseable is surfaced
        // as a plain string rather than dropped.
        Ok(rows
            .into_iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                (key, value)
            })
            .collect())
    }

    async fn set_state(&self, patch: &StateMap) -> Result<()> {
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await.context("set_state begin failed")?;
        for (key, value) in patch {
            sqlx::query(
                r#"
                INSERT INTO system_state (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                  value=excluded.value,
                  updated_at=excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("set_state upsert failed for key '{key}'"))?;
        }
        tx.commit().await.context("set_state commit failed")?;
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        sqlx::query_as::<_, Schedule>(
            r#"
            SELECT id, hour, minute, enabled
            FROM watering_schedules
            ORDER BY hour, minute
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list_schedules failed")
    }

    async fn create_schedule(&self, hour: i64, minute: i64, enabled: bool) -> Result<Schedule> {
        let now = now_rfc3339();
        sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO watering_schedules (hour, minute, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, hour, minute, enabled
            "#,
        )
        .bind(hour)
        .bind(minute)
        .bind(enabled)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .context("create_schedule failed")
    }

    async fn update_schedule(&self, id: i64, patch: SchedulePatch) -> Result<Option<Schedule>> {
        let current = sqlx::query_as::<_, Schedule>(
            "SELECT id, hour, minute, enabled FROM watering_schedules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("update_schedule lookup failed")?;

        let Some(current) = current else {
            return Ok(None);
        };

        let merged = Schedule {
            id,
            hour: patch.hour.unwrap_or(current.hour),
            minute: patch.minute.unwrap_or(current.minute),
            enabled: patch.enabled.unwrap_or(current.enabled),
        };

        sqlx::query(
            r#"
            UPDATE watering_schedules
            SET hour = ?, minute = ?, enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(merged.hour)
        .bind(merged.minute)
        .bind(merged.enabled)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update_schedule failed")?;

        Ok(Some(merged))
    }

    async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watering_schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_sensor_log(&self, entry: &NewSensorLog) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sensor_logs (humidity, analog_value, timestamp, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(entry.humidity)
        .bind(entry.analog_value)
        .bind(entry.timestamp)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("append_sensor_log failed")?;
        Ok(id)
    }

    async fn query_sensor_logs(&self, query: &SensorLogQuery) -> Result<LogPage<SensorLog>> {
        let entries = sqlx::query_as::<_, SensorLog>(
            r#"
            SELECT id, humidity, analog_value, timestamp, created_at
            FROM sensor_logs
            WHERE (? IS NULL OR timestamp >= ?)
              AND (? IS NULL OR timestamp <= ?)
            ORDER BY timestamp DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(query.start_time)
        .bind(query.start_time)
        .bind(query.end_time)
        .bind(query.end_time)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .context("query_sensor_logs failed")?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sensor_logs
            WHERE (? IS NULL OR timestamp >= ?)
              AND (? IS NULL OR timestamp <= ?)
            "#,
        )
        .bind(query.start_time)
        .bind(query.start_time)
        .bind(query.end_time)
        .bind(query.end_time)
        .fetch_one(&self.pool)
        .await
        .context("query_sensor_logs count failed")?;

        Ok(LogPage { entries, total })
    }

    async fn append_status_log(&self, entry: &NewStatusLog) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO status_logs (
              pump_status, threshold, watering_duration, auto_mode, is_raining,
              delayed_watering_enabled, delayed_watering_hours, delayed_watering_minutes,
              created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(entry.pump_status)
        .bind(entry.threshold)
        .bind(entry.watering_duration)
        .bind(entry.auto_mode)
        .bind(entry.is_raining)
        .bind(entry.delayed_watering_enabled)
        .bind(entry.delayed_watering_hours)
        .bind(entry.delayed_watering_minutes)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await
        .context("append_status_log failed")?;
        Ok(id)
    }

    async fn query_status_logs(&self, query: &StatusLogQuery) -> Result<LogPage<StatusLog>> {
        let entries = sqlx::query_as::<_, StatusLog>(
            r#"
            SELECT id, pump_status, threshold, watering_duration, auto_mode, is_raining,
                   delayed_watering_enabled, delayed_watering_hours, delayed_watering_minutes,
                   created_at
            FROM status_logs
            WHERE (? IS NULL OR created_at >= ?)
              AND (? IS NULL OR created_at <= ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&query.start_date)
        .bind(&query.start_date)
        .bind(&query.end_date)
        .bind(&query.end_date)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .context("query_status_logs failed")?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM status_logs
            WHERE (? IS NULL OR created_at >= ?)
              AND (? IS NULL OR created_at <= ?)
            "#,
        )
        .bind(&query.start_date)
        .bind(&query.start_date)
        .bind(&query.end_date)
        .bind(&query.end_date)
        .fetch_one(&self.pool)
        .await
        .context("query_status_logs count failed")?;

        Ok(LogPage { entries, total })
    }
}
