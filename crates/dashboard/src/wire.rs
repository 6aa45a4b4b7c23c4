//! MQTT message types shared by the link supervisor and the synchronizer.
//!
//! Inbound telemetry is "shape-shifting" on the wire: the firmware sends only
//! the fields that changed, so every status field is optional and merging is
//! explicit (see `ControlSettings::merge_status`).  Outbound commands are
//! sparse for the same reason; absent fields must not appear in the JSON at
//! all, the firmware treats presence as intent.

use serde::{Deserialize, Serialize};

use crate::state::SettingsPatch;

// ---------------------------------------------------------------------------
// Inbound telemetry
// ---------------------------------------------------------------------------

/// Status topic payload.  All fields optional; partial updates are expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub pump_status: Option<bool>,
    pub threshold: Option<f64>,
    pub watering_duration: Option<i64>,
    pub auto_mode: Option<bool>,
    pub is_raining: Option<bool>,
    pub schedule_enabled: Option<bool>,
    pub delayed_watering_enabled: Option<bool>,
    pub delay_hours: Option<i64>,
    pub delay_minutes: Option<i64>,
}

/// Sensor topic payload.  Replaces the local snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub humidity: f64,
    pub analog_value: i64,
    /// Device-side unix timestamp (seconds).
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// Command topic payload: only the fields the user changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// "on" / "off" — the firmware expects a string here, not a bool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watering_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_raining: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_hours: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_hour_1: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_minute_1: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_hour_2: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_minute_2: Option<i64>,
}

impl Command {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Translate a user settings patch into the matching sparse command.
    ///
    /// Disabling delayed watering maps to zeroed delay fields — that is how
    /// the firmware cancels the timer.  The global schedule flag is not
    /// carried here; it travels with the full schedule sync command so the
    /// slots and the flag always arrive together.
    pub fn from_patch(patch: &SettingsPatch) -> Self {
        let mut cmd = Command {
            threshold: patch.threshold,
            watering_duration: patch.watering_duration,
            auto_mode: patch.auto_mode,
            is_raining: patch.is_raining,
            ..Default::default()
        };
        if let Some(on) = patch.pump_status {
            cmd.pump = Some(if on { "on" } else { "off" }.to_string());
        }
        if patch.delayed_watering_enabled == Some(false) {
            cmd.delay_hours = Some(0);
            cmd.delay_minutes = Some(0);
        } else if patch.delayed_watering_enabled == Some(true)
            || patch.delayed_watering_hours.is_some()
            || patch.delayed_watering_minutes.is_some()
        {
            cmd.delay_hours = Some(patch.delayed_watering_hours.unwrap_or(0));
            cmd.delay_minutes = Some(patch.delayed_watering_minutes.unwrap_or(0));
        }
        cmd
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- StatusUpdate ------------------------------------------------------

    #[test]
    fn status_update_partial_payload() {
        let update: StatusUpdate = serde_json::from_str(r#"{"pump_status":true}"#).unwrap();
        assert_eq!(update.pump_status, Some(true));
        assert_eq!(update.threshold, None);
        assert_eq!(update.delay_minutes, None);
    }

    #[test]
    fn status_update_full_payload() {
        let json = r#"{
            "pump_status": false,
            "threshold": 55.5,
            "watering_duration": 90,
            "auto_mode": true,
            "is_raining": false,
            "schedule_enabled": true,
            "delayed_watering_enabled": true,
            "delay_hours": 1,
            "delay_minutes": 20
        }"#;
        let update: StatusUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.threshold, Some(55.5));
        assert_eq!(update.delay_hours, Some(1));
    }

    #[test]
    fn status_update_extra_fields_ignored() {
        let update: StatusUpdate =
            serde_json::from_str(r#"{"pump_status":true,"firmware":"1.2.3"}"#).unwrap();
        assert_eq!(update.pump_status, Some(true));
    }

    // -- SensorReading -----------------------------------------------------

    #[test]
    fn sensor_reading_round_trip() {
        let json = r#"{"humidity":48.2,"analog_value":2710,"timestamp":1700000000}"#;
        let reading: SensorReading = serde_json::from_str(json).unwrap();
        assert_eq!(reading.humidity, 48.2);
        assert_eq!(reading.analog_value, 2710);
        assert_eq!(reading.timestamp, 1_700_000_000);
    }

    #[test]
    fn sensor_reading_missing_field_fails() {
        assert!(serde_json::from_str::<SensorReading>(r#"{"humidity":48.2}"#).is_err());
    }

    // -- Command -----------------------------------------------------------

    #[test]
    fn command_serializes_sparse() {
        let cmd = Command {
            pump: Some("on".to_string()),
            ..Default::default()
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v, json!({"pump": "on"}));
    }

    #[test]
    fn empty_command_serializes_to_empty_object() {
        let v = serde_json::to_value(Command::default()).unwrap();
        assert_eq!(v, json!({}));
        assert!(Command::default().is_empty());
    }

    #[test]
    fn from_patch_maps_pump_to_string() {
        let patch = SettingsPatch {
            pump_status: Some(true),
            ..Default::default()
        };
        assert_eq!(Command::from_patch(&patch).pump.as_deref(), Some("on"));

        let patch = SettingsPatch {
            pump_status: Some(false),
            ..Default::default()
        };
        assert_eq!(Command::from_patch(&patch).pump.as_deref(), Some("off"));
    }

    #[test]
    fn from_patch_passes_plain_fields() {
        let patch = SettingsPatch {
            threshold: Some(65.0),
            watering_duration: Some(120),
            auto_mode: Some(false),
            is_raining: Some(true),
            ..Default::default()
        };
        let cmd = Command::from_patch(&patch);
        assert_eq!(cmd.threshold, Some(65.0));
        assert_eq!(cmd.watering_duration, Some(120));
        assert_eq!(cmd.auto_mode, Some(false));
        assert_eq!(cmd.is_raining, Some(true));
        assert!(cmd.pump.is_none());
    }

    #[test]
    fn from_patch_delayed_watering_enable() {
        let patch = SettingsPatch {
            delayed_watering_enabled: Some(true),
            delayed_watering_hours: Some(2),
            delayed_watering_minutes: Some(15),
            ..Default::default()
        };
        let cmd = Command::from_patch(&patch);
        assert_eq!(cmd.delay_hours, Some(2));
        assert_eq!(cmd.delay_minutes, Some(15));
    }

    #[test]
    fn from_patch_delayed_watering_cancel_zeroes_delay() {
        let patch = SettingsPatch {
            delayed_watering_enabled: Some(false),
            delayed_watering_hours: Some(2),
            delayed_watering_minutes: Some(15),
            ..Default::default()
        };
        let cmd = Command::from_patch(&patch);
        assert_eq!(cmd.delay_hours, Some(0));
        assert_eq!(cmd.delay_minutes, Some(0));
    }

    #[test]
    fn from_patch_schedule_flag_not_carried() {
        let patch = SettingsPatch {
            schedule_enabled: Some(true),
            ..Default::default()
        };
        let cmd = Command::from_patch(&patch);
        assert!(cmd.is_empty(), "schedule flag travels with the slot sync");
    }

    #[test]
    fn command_deserialize_ignores_unknown() {
        let cmd: Command = serde_json::from_str(r#"{"threshold":60,"nonsense":1}"#).unwrap();
        assert_eq!(cmd.threshold, Some(60.0));
    }
}
