//! In-memory dashboard state shared between the link supervisor, the state
//! synchronizer and the web layer.
//!
//! The settings block mirrors what the device reports; it is hydrated from
//! the store at startup, mutated optimistically by user actions, and
//! overwritten field-by-field by inbound status telemetry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::link::machine::LinkStatus;
use crate::wire::{SensorReading, StatusUpdate};

/// Maximum number of notices retained in the ring buffer.
const MAX_NOTICES: usize = 200;

pub type SharedState = Arc<RwLock<DashState>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The mirrored device settings.  Serialized keys double as the persistence
/// keys of the state table, so renaming a field is a data migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSettings {
    pub pump_status: bool,
    pub threshold: f64,
    /// Seconds the pump runs per watering.
    pub watering_duration: i64,
    pub auto_mode: bool,
    pub is_raining: bool,
    pub schedule_enabled: bool,
    pub delayed_watering_enabled: bool,
    pub delayed_watering_hours: i64,
    pub delayed_watering_minutes: i64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            pump_status: false,
            threshold: 50.0,
            watering_duration: 60,
            auto_mode: true,
            is_raining: false,
            schedule_enabled: true,
            delayed_watering_enabled: false,
            delayed_watering_hours: 0,
            delayed_watering_minutes: 10,
        }
    }
}

impl ControlSettings {
    /// Rebuild settings from the persisted key/value map.  Unknown keys and
    /// values of the wrong type are ignored; missing keys keep their default.
    pub fn from_kv(map: &HashMap<String, Value>) -> Self {
        let mut settings = Self::default();
        for (key, value) in map {
            let mut single = serde_json::Map::new();
            single.insert(key.clone(), value.clone());
            if let Ok(patch) = serde_json::from_value::<SettingsPatch>(Value::Object(single)) {
                patch.apply(&mut settings);
            }
        }
        settings
    }

    /// Merge an inbound status payload: a field present in the payload
    /// overwrites, an absent field is retained.
    pub fn merge_status(&mut self, update: &StatusUpdate) {
        if let Some(v) = update.pump_status {
            self.pump_status = v;
        }
        if let Some(v) = update.threshold {
            self.threshold = v;
        }
        if let Some(v) = update.watering_duration {
            self.watering_duration = v;
        }
        if let Some(v) = update.auto_mode {
            self.auto_mode = v;
        }
        if let Some(v) = update.is_raining {
            self.is_raining = v;
        }
        if let Some(v) = update.schedule_enabled {
            self.schedule_enabled = v;
        }
        if let Some(v) = update.delayed_watering_enabled {
            self.delayed_watering_enabled = v;
        }
        if let Some(v) = update.delay_hours {
            self.delayed_watering_hours = v;
        }
        if let Some(v) = update.delay_minutes {
            self.delayed_watering_minutes = v;
        }
    }
}

/// Partial settings update from the HTTP layer.  Absent fields are left
/// untouched everywhere: in memory, in the store, and on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watering_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_raining: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_watering_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_watering_hours: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_watering_minutes: Option<i64>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, settings: &mut ControlSettings) {
        if let Some(v) = self.pump_status {
            settings.pump_status = v;
        }
        if let Some(v) = self.threshold {
            settings.threshold = v;
        }
        if let Some(v) = self.watering_duration {
            settings.watering_duration = v;
        }
        if let Some(v) = self.auto_mode {
            settings.auto_mode = v;
        }
        if let Some(v) = self.is_raining {
            settings.is_raining = v;
        }
        if let Some(v) = self.schedule_enabled {
            settings.schedule_enabled = v;
        }
        if let Some(v) = self.delayed_watering_enabled {
            settings.delayed_watering_enabled = v;
        }
        if let Some(v) = self.delayed_watering_hours {
            settings.delayed_watering_hours = v;
        }
        if let Some(v) = self.delayed_watering_minutes {
            settings.delayed_watering_minutes = v;
        }
    }

    /// The present fields as a key/value map for a partial store upsert.
    pub fn to_kv(&self) -> HashMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: NoticeKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Link,
    Command,
    Sync,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Shared state container
// ---------------------------------------------------------------------------

pub struct DashState {
    pub started_at: Instant,
    pub settings: ControlSettings,
    pub sensor: Option<SensorReading>,
    pub notices: VecDeque<Notice>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub link: LinkStatus,
    pub settings: ControlSettings,
    pub sensor: Option<SensorReading>,
    pub notices: Vec<Notice>,
}

impl DashState {
    pub fn new(settings: ControlSettings) -> Self {
        Self {
            started_at: Instant::now(),
            settings,
            sensor: None,
            notices: VecDeque::with_capacity(MAX_NOTICES),
        }
    }

    pub fn record_link(&mut self, detail: String) {
        self.push_notice(NoticeKind::Link, detail);
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_notice(NoticeKind::Command, detail);
    }

    pub fn record_sync(&mut self, detail: String) {
        self.push_notice(NoticeKind::Sync, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_notice(NoticeKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_notice(NoticeKind::System, detail);
    }

    /// Snapshot for the status endpoint, newest notice first.
    pub fn to_status(&self, link: LinkStatus) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            link,
            settings: self.settings.clone(),
            sensor: self.sensor.clone(),
            notices: self.notices.iter().rev().cloned().collect(),
        }
    }

    fn push_notice(&mut self, kind: NoticeKind, detail: String) {
        if self.notices.len() >= MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(Notice {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
