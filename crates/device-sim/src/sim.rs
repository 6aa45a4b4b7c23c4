//! Stateful stand-in for the irrigation firmware.
//!
//! Models the controller's visible behaviour closely enough to drive the
//! dashboard during development: a drifting soil humidity value (random walk
//! with mean reversion plus read noise), pump response to watering, and the
//! auto-mode decision the real firmware makes from threshold and rain state.

use serde::{Deserialize, Serialize};

/// ESP32 ADC full scale (12-bit).
const ADC_MAX: f64 = 4095.0;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Inbound command: sparse, only the fields the dashboard sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandMsg {
    pub pump: Option<String>,
    pub threshold: Option<f64>,
    pub watering_duration: Option<i64>,
    pub auto_mode: Option<bool>,
    pub is_raining: Option<bool>,
    pub delay_hours: Option<i64>,
    pub delay_minutes: Option<i64>,
    pub schedule_enabled: Option<bool>,
    pub schedule_hour_1: Option<i64>,
    pub schedule_minute_1: Option<i64>,
    pub schedule_hour_2: Option<i64>,
    pub schedule_minute_2: Option<i64>,
}

/// Outbound status: the full settings block, as the firmware reports it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMsg {
    pub pump_status: bool,
    pub threshold: f64,
    pub watering_duration: i64,
    pub auto_mode: bool,
    pub is_raining: bool,
    pub schedule_enabled: bool,
    pub delayed_watering_enabled: bool,
    pub delay_hours: i64,
    pub delay_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorMsg {
    pub humidity: f64,
    pub analog_value: i64,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Device model
// ---------------------------------------------------------------------------

pub struct DeviceModel {
    pump_on: bool,
    threshold: f64,
    watering_duration: i64,
    auto_mode: bool,
    is_raining: bool,
    schedule_enabled: bool,
    delay_hours: i64,
    delay_minutes: i64,
    schedule_slots: [(i64, i64); 2],

    /// Current "true" soil humidity in percent.
    humidity: f64,
    /// Per-tick drying drift (percent, negative = drying).
    drift: f64,
    /// Random walk sigma.
    walk_sigma: f64,
    /// Pull toward the centre humidity.
    mean_reversion: f64,
    /// Humidity gain per tick while the pump runs.
    wet_rate: f64,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceModel {
    pub fn new() -> Self {
        Self {
            pump_on: false,
            threshold: 50.0,
            watering_duration: 60,
            auto_mode: true,
            is_raining: false,
            schedule_enabled: true,
            delay_hours: 0,
            delay_minutes: 0,
            schedule_slots: [(0, 0); 2],
            humidity: 55.0,
            drift: -0.35,
            walk_sigma: 0.6,
            mean_reversion: 0.01,
            wet_rate: 2.5,
        }
    }

    /// Apply an inbound command.  Returns true when any setting changed, in
    /// which case the caller republishes a full status.
    pub fn apply(&mut self, cmd: &CommandMsg) -> bool {
        let mut changed = false;
        if let Some(pump) = &cmd.pump {
            // In auto mode the firmware keeps pump authority; manual pump
            // commands are ignored just like on the real device.
            if !self.auto_mode {
                let on = pump.eq_ignore_ascii_case("on");
                changed |= self.pump_on != on;
                self.pump_on = on;
            }
        }
        if let Some(v) = cmd.threshold {
            changed |= self.threshold != v;
            self.threshold = v;
        }
        if let Some(v) = cmd.watering_duration {
            changed |= self.watering_duration != v;
            self.watering_duration = v;
        }
        if let Some(v) = cmd.auto_mode {
            changed |= self.auto_mode != v;
            self.auto_mode = v;
        }
        if let Some(v) = cmd.is_raining {
            changed |= self.is_raining != v;
            self.is_raining = v;
        }
        if let Some(v) = cmd.schedule_enabled {
            changed |= self.schedule_enabled != v;
            self.schedule_enabled = v;
        }
        if let (Some(h), Some(m)) = (cmd.delay_hours, cmd.delay_minutes) {
            changed |= self.delay_hours != h || self.delay_minutes != m;
            self.delay_hours = h;
            self.delay_minutes = m;
        }
        if let (Some(h), Some(m)) = (cmd.schedule_hour_1, cmd.schedule_minute_1) {
            changed |= self.schedule_slots[0] != (h, m);
            self.schedule_slots[0] = (h, m);
        }
        if let (Some(h), Some(m)) = (cmd.schedule_hour_2, cmd.schedule_minute_2) {
            changed |= self.schedule_slots[1] != (h, m);
            self.schedule_slots[1] = (h, m);
        }
        changed
    }

    /// Advance the soil model one sampling tick and run the auto-mode pump
    /// decision.  Returns true when the pump state flipped.
    pub fn tick(&mut self) -> bool {
        let pull = self.mean_reversion * (50.0 - self.humidity);
        let walk = self.walk_sigma * approx_std_normal();
        let wet = if self.pump_on { self.wet_rate } else { 0.0 };
        let rain = if self.is_raining { 1.2 } else { 0.0 };
        self.humidity = (self.humidity + self.drift + pull + walk + wet + rain).clamp(0.0, 100.0);

        if self.auto_mode {
            let want = self.humidity < self.threshold && !self.is_raining;
            if want != self.pump_on {
                self.pump_on = want;
                return true;
            }
        }
        false
    }

    /// Current sensor reading.
    pub fn sensor(&self, timestamp: i64) -> SensorMsg {
        // Capacitive probes read high when dry.
        let analog = ((100.0 - self.humidity) / 100.0 * ADC_MAX).round() as i64;
        SensorMsg {
            humidity: (self.humidity * 10.0).round() / 10.0,
            analog_value: analog,
            timestamp,
        }
    }

    /// Full status block for the status topic.
    pub fn status(&self) -> StatusMsg {
        StatusMsg {
            pump_status: self.pump_on,
            threshold: self.threshold,
            watering_duration: self.watering_duration,
            auto_mode: self.auto_mode,
            is_raining: self.is_raining,
            schedule_enabled: self.schedule_enabled,
            delayed_watering_enabled: self.delay_hours > 0 || self.delay_minutes > 0,
            delay_hours: self.delay_hours,
            delay_minutes: self.delay_minutes,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
