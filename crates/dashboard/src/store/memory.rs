//! In-process backend for the persistence gateway.
//!
//! Satisfies the same contract as the SQLite backend; used by the test suite
//! and by `DB_URL=memory` runs where nothing should touch disk.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use super::{
    now_rfc3339, LogPage, NewSensorLog, NewStatusLog, Schedule, SchedulePatch, SensorLog,
    SensorLogQuery, StateMap, StatusLog, StatusLogQuery, Store,
};

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    state: StateMap,
    schedules: Vec<Schedule>,
    next_schedule_id: i64,
    sensor_logs: Vec<SensorLog>,
    next_sensor_id: i64,
    status_logs: Vec<StatusLog>,
    next_status_id: i64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test; the data is still fine.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl Store for MemStore {
    async fn get_state(&self) -> Result<StateMap> {
        Ok(self.lock().state.clone())
    }

    async fn set_state(&self, patch: &StateMap) -> Result<()> {
        let mut inner = self.lock();
        for (key, value) in patch {
            inner.state.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut schedules = self.lock().schedules.clone();
        schedules.sort_by_key(|s| (s.hour, s.minute, s.id));
        Ok(schedules)
    }

    async fn create_schedule(&self, hour: i64, minute: i64, enabled: bool) -> Result<Schedule> {
        let mut inner = self.lock();
        let schedule = Schedule {
            id: next_id(&mut inner.next_schedule_id),
            hour,
            minute,
            enabled,
        };
        inner.schedules.push(schedule.clone());
        Ok(schedule)
    }

    async fn update_schedule(&self, id: i64, patch: SchedulePatch) -> Result<Option<Schedule>> {
        let mut inner = self.lock();
        let Some(schedule) = inner.schedules.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        if let Some(hour) = patch.hour {
            schedule.hour = hour;
        }
        if let Some(minute) = patch.minute {
            schedule.minute = minute;
        }
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        Ok(Some(schedule.clone()))
    }

    async fn delete_schedule(&self, id: i64) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.schedules.len();
        inner.schedules.retain(|s| s.id != id);
        Ok(inner.schedules.len() < before)
    }

    async fn append_sensor_log(&self, entry: &NewSensorLog) -> Result<i64> {
        let mut inner = self.lock();
        let id = next_id(&mut inner.next_sensor_id);
        inner.sensor_logs.push(SensorLog {
            id,
            humidity: entry.humidity,
            analog_value: entry.analog_value,
            timestamp: entry.timestamp,
            created_at: now_rfc3339(),
        });
        Ok(id)
    }

    async fn query_sensor_logs(&self, query: &SensorLogQuery) -> Result<LogPage<SensorLog>> {
        let inner = self.lock();
        let mut matched: Vec<SensorLog> = inner
            .sensor_logs
            .iter()
            .filter(|log| query.start_time.is_none_or(|t| log.timestamp >= t))
            .filter(|log| query.end_time.is_none_or(|t| log.timestamp <= t))
            .cloned()
            .collect();
        matched.sort_by_key(|log| (std::cmp::Reverse(log.timestamp), std::cmp::Reverse(log.id)));
        Ok(paginate(matched, query.limit, query.offset))
    }

    async fn append_status_log(&self, entry: &NewStatusLog) -> Result<i64> {
        let mut inner = self.lock();
        let id = next_id(&mut inner.next_status_id);
        inner.status_logs.push(StatusLog {
            id,
            pump_status: entry.pump_status,
            threshold: entry.threshold,
            watering_duration: entry.watering_duration,
            auto_mode: entry.auto_mode,
            is_raining: entry.is_raining,
            delayed_watering_enabled: entry.delayed_watering_enabled,
            delayed_watering_hours: entry.delayed_watering_hours,
            delayed_watering_minutes: entry.delayed_watering_minutes,
            created_at: now_rfc3339(),
        });
        Ok(id)
    }

    async fn query_status_logs(&self, query: &StatusLogQuery) -> Result<LogPage<StatusLog>> {
        let inner = self.lock();
        let mut matched: Vec<StatusLog> = inner
            .status_logs
            .iter()
            .filter(|log| {
                query
                    .start_date
                    .as_deref()
                    .is_none_or(|d| log.created_at.as_str() >= d)
            })
            .filter(|log| {
                query
                    .end_date
                    .as_deref()
                    .is_none_or(|d| log.created_at.as_str() <= d)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(paginate(matched, query.limit, query.offset))
    }
}

fn paginate<T>(matched: Vec<T>, limit: i64, offset: i64) -> LogPage<T> {
    let total = matched.len() as i64;
    let entries = matched
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect();
    LogPage { entries, total }
}
