//! State synchronizer: keeps the in-memory mirror, the store and the remote
//! device consistent.
//!
//! Inbound telemetry is applied to the shared state and logged to the store
//! in the background; log failures never block message handling or reach the
//! user.  Outbound schedule syncs are coalesced behind a 2 s quiet period so
//! a burst of edits produces a single device command.

use std::time::Duration;

use tracing::warn;

use crate::debounce::Debouncer;
use crate::link::Link;
use crate::state::SharedState;
use crate::store::{NewSensorLog, NewStatusLog, Schedule, Store};
use crate::wire::{Command, SensorReading, StatusUpdate};

/// Quiet period before coalesced schedule edits are pushed to the device.
pub const SCHEDULE_SYNC_DEBOUNCE: Duration = Duration::from_secs(2);

/// The device accepts exactly two schedule slots; extra enabled schedules
/// are not sent.  A protocol limit of the firmware, not a dashboard choice.
pub const DEVICE_SCHEDULE_SLOTS: usize = 2;

#[derive(Clone)]
pub struct Synchronizer<S: Store> {
    store: S,
    state: SharedState,
    link: Link,
    debounce: Debouncer,
}

impl<S: Store> Synchronizer<S> {
    pub fn new(store: S, state: SharedState, link: Link) -> Self {
        Self {
            store,
            state,
            link,
            debounce: Debouncer::new(SCHEDULE_SYNC_DEBOUNCE),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    // -- inbound telemetry --------------------------------------------------

    /// Merge a status payload into the mirrored settings, then log the merged
    /// snapshot in the background.
    pub async fn apply_status(&self, update: StatusUpdate) {
        let merged = {
            let mut state = self.state.write().await;
            state.settings.merge_status(&update);
            state.settings.clone()
        };

        let entry = NewStatusLog {
            pump_status: merged.pump_status,
            threshold: merged.threshold,
            watering_duration: merged.watering_duration,
            auto_mode: merged.auto_mode,
            is_raining: merged.is_raining,
            delayed_watering_enabled: merged.delayed_watering_enabled,
            delayed_watering_hours: merged.delayed_watering_hours,
            delayed_watering_minutes: merged.delayed_watering_minutes,
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_status_log(&entry).await {
                warn!("status log append failed: {e:#}");
            }
        });
    }

    /// Replace the sensor snapshot wholesale, then log it in the background.
    pub async fn apply_sensor(&self, reading: SensorReading) {
        self.state.write().await.sensor = Some(reading.clone());

        let entry = NewSensorLog {
            humidity: reading.humidity,
            analog_value: reading.analog_value,
            timestamp: reading.timestamp,
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_sensor_log(&entry).await {
                warn!("sensor log append failed: {e:#}");
            }
        });
    }

    // -- outbound commands --------------------------------------------------

    /// Publish a sparse command.  When the link is down the command is
    /// dropped on the spot and the failure is surfaced as a notice.
    pub async fn send_command(&self, command: Command) -> anyhow::Result<()> {
        match self.link.publish(&command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state
                    .write()
                    .await
                    .record_error(format!("command not sent: {e:#}"));
                Err(e)
            }
        }
    }

    /// Build the schedule sync command: the first two enabled schedules (in
    /// list order) fill the device slots; unfilled slots are zeroed.
    pub fn schedule_sync_command(schedule_enabled: bool, schedules: &[Schedule]) -> Command {
        let mut slots = schedules
            .iter()
            .filter(|s| s.enabled)
            .take(DEVICE_SCHEDULE_SLOTS);
        let first = slots.next();
        let second = slots.next();

        Command {
            schedule_enabled: Some(schedule_enabled),
            schedule_hour_1: Some(first.map_or(0, |s| s.hour)),
            schedule_minute_1: Some(first.map_or(0, |s| s.minute)),
            schedule_hour_2: Some(second.map_or(0, |s| s.hour)),
            schedule_minute_2: Some(second.map_or(0, |s| s.minute)),
            ..Default::default()
        }
    }

    /// Push the current schedule set to the device right now.
    pub async fn sync_schedules_now(&self) {
        let schedules = match self.store.list_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                warn!("schedule sync: list failed: {e:#}");
                self.state
                    .write()
                    .await
                    .record_error(format!("schedule sync failed: {e:#}"));
                return;
            }
        };
        let schedule_enabled = self.state.read().await.settings.schedule_enabled;
        let enabled_count = schedules.iter().filter(|s| s.enabled).count();
        let command = Self::schedule_sync_command(schedule_enabled, &schedules);

        match self.link.publish(&command).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                state.record_sync(format!(
                    "synced {} of {enabled_count} enabled schedule(s) to device",
                    enabled_count.min(DEVICE_SCHEDULE_SLOTS)
                ));
            }
            Err(e) => {
                self.state
                    .write()
                    .await
                    .record_error(format!("schedule sync not sent: {e:#}"));
            }
        }
    }

    /// Coalesce bursts of schedule edits into one sync after the quiet
    /// period.  Each call re-arms the timer.
    pub async fn sync_schedules_debounced(&self) {
        let this = self.clone();
        self.debounce
            .call(move || async move { this.sync_schedules_now().await })
            .await;
    }

    /// Cancel any pending debounced sync.  Called on teardown.
    pub async fn cancel_pending(&self) {
        self.debounce.cancel().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
