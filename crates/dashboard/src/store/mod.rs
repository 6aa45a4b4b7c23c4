//! Persistence gateway: system-state key/value pairs, watering schedules and
//! append-only telemetry logs.
//!
//! The [`Store`] trait is the single capability set both backends satisfy;
//! business logic never talks to a concrete backend.  `SqliteStore` is the
//! production backend, `MemStore` backs tests and `DB_URL=memory` runs.

mod memory;
mod sqlite;

pub use memory::MemStore;
pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Persisted system-state mapping: setting name -> JSON value.
pub type StateMap = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: i64,
    pub hour: i64,
    pub minute: i64,
    pub enabled: bool,
}

/// Partial schedule update; absent fields are left untouched.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SchedulePatch {
    pub hour: Option<i64>,
    pub minute: Option<i64>,
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        self.hour.is_none() && self.minute.is_none() && self.enabled.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SensorLog {
    pub id: i64,
    pub humidity: f64,
    pub analog_value: i64,
    /// Device-side unix timestamp (seconds).
    pub timestamp: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSensorLog {
    pub humidity: f64,
    pub analog_value: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StatusLog {
    pub id: i64,
    pub pump_status: bool,
    pub threshold: f64,
    pub watering_duration: i64,
    pub auto_mode: bool,
    pub is_raining: bool,
    pub delayed_watering_enabled: bool,
    pub delayed_watering_hours: i64,
    pub delayed_watering_minutes: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusLog {
    pub pump_status: bool,
    pub threshold: f64,
    pub watering_duration: i64,
    pub auto_mode: bool,
    pub is_raining: bool,
    pub delayed_watering_enabled: bool,
    pub delayed_watering_hours: i64,
    pub delayed_watering_minutes: i64,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Sensor log filter: unix-second bounds on the device timestamp.
#[derive(Debug, Clone)]
pub struct SensorLogQuery {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SensorLogQuery {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

/// Status log filter: RFC 3339 bounds on the row creation time.
#[derive(Debug, Clone)]
pub struct StatusLogQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for StatusLogQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

/// One page of log rows plus the total match count before pagination.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage<T> {
    pub entries: Vec<T>,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// The gateway contract
// ---------------------------------------------------------------------------

pub trait Store: Clone + Send + Sync + 'static {
    /// All persisted state keys.  Missing keys simply don't appear.
    fn get_state(&self) -> impl Future<Output = Result<StateMap>> + Send;

    /// Upsert the given keys; keys absent from `patch` are untouched.
    fn set_state(&self, patch: &StateMap) -> impl Future<Output = Result<()>> + Send;

    /// Schedules ordered ascending by (hour, minute).
    fn list_schedules(&self) -> impl Future<Output = Result<Vec<Schedule>>> + Send;

    fn create_schedule(
        &self,
        hour: i64,
        minute: i64,
        enabled: bool,
    ) -> impl Future<Output = Result<Schedule>> + Send;

    /// `Ok(None)` when the id is unknown.
    fn update_schedule(
        &self,
        id: i64,
        patch: SchedulePatch,
    ) -> impl Future<Output = Result<Option<Schedule>>> + Send;

    /// `Ok(false)` when the id is unknown.
    fn delete_schedule(&self, id: i64) -> impl Future<Output = Result<bool>> + Send;

    fn append_sensor_log(&self, entry: &NewSensorLog) -> impl Future<Output = Result<i64>> + Send;

    /// Newest first.
    fn query_sensor_logs(
        &self,
        query: &SensorLogQuery,
    ) -> impl Future<Output = Result<LogPage<SensorLog>>> + Send;

    fn append_status_log(&self, entry: &NewStatusLog) -> impl Future<Output = Result<i64>> + Send;

    /// Newest first.
    fn query_status_logs(
        &self,
        query: &StatusLogQuery,
    ) -> impl Future<Output = Result<LogPage<StatusLog>>> + Send;
}

/// Row creation timestamp: RFC 3339, UTC, whole seconds so the text sorts
/// chronologically.
pub(crate) fn now_rfc3339() -> String {
    let t = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

// ===========================================================================
// Tests — contract suite run against both backends
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sqlite() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn sensor_entry(ts: i64) -> NewSensorLog {
        NewSensorLog {
            humidity: 42.5,
            analog_value: 2800,
            timestamp: ts,
        }
    }

    fn status_entry() -> NewStatusLog {
        NewStatusLog {
            pump_status: true,
            threshold: 55.0,
            watering_duration: 90,
            auto_mode: false,
            is_raining: false,
            delayed_watering_enabled: true,
            delayed_watering_hours: 1,
            delayed_watering_minutes: 30,
        }
    }

    // -- shared contract assertions ----------------------------------------

    async fn check_state_upsert<S: Store>(store: S) {
        assert!(store.get_state().await.unwrap().is_empty());

        let mut patch = StateMap::new();
        patch.insert("threshold".into(), json!(60.0));
        patch.insert("pumpStatus".into(), json!(true));
        store.set_state(&patch).await.unwrap();

        // Partial update leaves other keys untouched.
        let mut patch = StateMap::new();
        patch.insert("threshold".into(), json!(70.0));
        store.set_state(&patch).await.unwrap();

        let state = store.get_state().await.unwrap();
        assert_eq!(state["threshold"], json!(70.0));
        assert_eq!(state["pumpStatus"], json!(true));
    }

    async fn check_schedule_round_trip<S: Store>(store: S) {
        let created = store.create_schedule(7, 30, true).await.unwrap();
        assert!(created.id > 0);
        assert_eq!((created.hour, created.minute), (7, 30));
        assert!(created.enabled);

        let listed = store.list_schedules().await.unwrap();
        assert!(listed
            .iter()
            .any(|s| s.id == created.id && s.hour == 7 && s.minute == 30 && s.enabled));
    }

    async fn check_schedule_ordering<S: Store>(store: S) {
        store.create_schedule(18, 0, true).await.unwrap();
        store.create_schedule(6, 30, true).await.unwrap();
        store.create_schedule(6, 5, false).await.unwrap();
        let listed = store.list_schedules().await.unwrap();
        let times: Vec<(i64, i64)> = listed.iter().map(|s| (s.hour, s.minute)).collect();
        assert_eq!(times, vec![(6, 5), (6, 30), (18, 0)]);
    }

    async fn check_schedule_update<S: Store>(store: S) {
        let created = store.create_schedule(7, 0, true).await.unwrap();
        let updated = store
            .update_schedule(
                created.id,
                SchedulePatch {
                    minute: Some(45),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.hour, 7, "untouched field kept");
        assert_eq!(updated.minute, 45);
        assert!(updated.enabled);

        let toggled = store
            .update_schedule(
                created.id,
                SchedulePatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!toggled.enabled);
        assert_eq!(toggled.minute, 45);
    }

    async fn check_schedule_not_found<S: Store>(store: S) {
        let missing = store
            .update_schedule(
                9999,
                SchedulePatch {
                    hour: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(missing.is_none());
        assert!(!store.delete_schedule(9999).await.unwrap());
    }

    async fn check_schedule_delete<S: Store>(store: S) {
        let created = store.create_schedule(12, 0, true).await.unwrap();
        assert!(store.delete_schedule(created.id).await.unwrap());
        assert!(store.list_schedules().await.unwrap().is_empty());
    }

    async fn check_sensor_logs<S: Store>(store: S) {
        for ts in [100, 200, 300, 400] {
            store.append_sensor_log(&sensor_entry(ts)).await.unwrap();
        }

        let page = store
            .query_sensor_logs(&SensorLogQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        let times: Vec<i64> = page.entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![400, 300, 200, 100], "newest first");
        assert!(!page.entries[0].created_at.is_empty());

        // Time-range filter is inclusive on both ends.
        let page = store
            .query_sensor_logs(&SensorLogQuery {
                start_time: Some(200),
                end_time: Some(300),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.entries.len(), 2);

        // Pagination: total counts all matches, not the page.
        let page = store
            .query_sensor_logs(&SensorLogQuery {
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        let times: Vec<i64> = page.entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![300, 200]);
    }

    async fn check_status_logs<S: Store>(store: S) {
        let id = store.append_status_log(&status_entry()).await.unwrap();
        assert!(id > 0);

        let page = store
            .query_status_logs(&StatusLogQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let row = &page.entries[0];
        assert!(row.pump_status);
        assert_eq!(row.threshold, 55.0);
        assert_eq!(row.watering_duration, 90);
        assert!(!row.auto_mode);
        assert!(row.delayed_watering_enabled);
        assert_eq!(row.delayed_watering_minutes, 30);

        // A future start date excludes the row; a past one includes it.
        let page = store
            .query_status_logs(&StatusLogQuery {
                start_date: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 0);

        let page = store
            .query_status_logs(&StatusLogQuery {
                start_date: Some("2000-01-01T00:00:00Z".into()),
                end_date: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    // -- sqlite ------------------------------------------------------------

    #[tokio::test]
    async fn sqlite_state_upsert() {
        check_state_upsert(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_schedule_round_trip() {
        check_schedule_round_trip(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_schedule_ordering() {
        check_schedule_ordering(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_schedule_update() {
        check_schedule_update(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_schedule_not_found() {
        check_schedule_not_found(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_schedule_delete() {
        check_schedule_delete(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_sensor_logs() {
        check_sensor_logs(sqlite().await).await;
    }

    #[tokio::test]
    async fn sqlite_status_logs() {
        check_status_logs(sqlite().await).await;
    }

    // -- memory ------------------------------------------------------------

    #[tokio::test]
    async fn memory_state_upsert() {
        check_state_upsert(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_schedule_round_trip() {
        check_schedule_round_trip(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_schedule_ordering() {
        check_schedule_ordering(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_schedule_update() {
        check_schedule_update(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_schedule_not_found() {
        check_schedule_not_found(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_schedule_delete() {
        check_schedule_delete(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_sensor_logs() {
        check_sensor_logs(MemStore::new()).await;
    }

    #[tokio::test]
    async fn memory_status_logs() {
        check_status_logs(MemStore::new()).await;
    }

    // -- helpers -----------------------------------------------------------

    #[test]
    fn now_rfc3339_shape() {
        let s = now_rfc3339();
        assert_eq!(s.len(), 20);
        assert!(s.ends_with('Z'));
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], "T");
    }
}
