//! Pure state machine for the broker link lifecycle.
//!
//! Every broker event and timer is funnelled through [`LinkMachine::handle`],
//! which returns the effects the driver must perform.  The machine itself
//! never touches the network, so the full reconnect behaviour is testable
//! without a broker.
//!
//! ```text
//! Idle ──start──▶ Connecting ──connack──▶ Connected
//!                     │ ▲                     │
//!                 lost│ │retry due        lost│
//!                     ▼ │                     ▼
//!                  Reconnecting ◀──────────────
//!                     │
//!                     │ retry ceiling reached
//!                     ▼
//!                  Exhausted   (terminal until restarted)
//! ```

use std::time::Duration;

use serde::Serialize;

/// Bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT keep-alive interval.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// First reconnect delay; doubles per attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(2_000);

/// Ceiling on the reconnect delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);

/// After this many failed retries the machine gives up for good.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// Public status (what the UI sees)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// All retries spent.  Requires a restart; no further attempts are made.
    Exhausted,
}

// ---------------------------------------------------------------------------
// Events and effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Owner asks the machine to begin (initial start or restart after
    /// exhaustion).
    Start,
    /// Broker accepted the connection.
    ConnAck,
    /// Broker rejected one of the telemetry subscriptions.
    SubscribeFailed(String),
    /// Connection dropped, connect attempt failed, or connect timed out.
    ConnectionLost(String),
    /// The scheduled reconnect timer fired.
    RetryDue,
    /// Owner tears the link down.  Suppresses everything that follows.
    Shutdown,
}

/// Side effects the driver performs in order.  `OpenConnection` implies
/// force-terminating the previous handle before dialing, so at most one
/// handle is ever live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenConnection,
    Subscribe,
    ScheduleRetry(Duration),
    CancelRetry,
    CloseConnection,
    SetStatus(LinkStatus),
    Notify(Level, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

// ---------------------------------------------------------------------------
// The machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
}

#[derive(Debug)]
pub struct LinkMachine {
    phase: Phase,
    /// Retries scheduled since the last successful connect.
    retries: u32,
    /// Set by `Shutdown`; all later events are ignored.
    shut_down: bool,
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            retries: 0,
            shut_down: false,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn is_connecting(&self) -> bool {
        self.phase == Phase::Connecting
    }

    pub fn status(&self) -> LinkStatus {
        match self.phase {
            Phase::Idle => LinkStatus::Disconnected,
            Phase::Connecting => LinkStatus::Connecting,
            Phase::Connected => LinkStatus::Connected,
            Phase::Reconnecting => LinkStatus::Reconnecting {
                attempt: self.retries,
            },
            Phase::Exhausted => LinkStatus::Exhausted,
        }
    }

    /// Apply one event and return the effects to perform, in order.
    pub fn handle(&mut self, event: LinkEvent) -> Vec<Effect> {
        if self.shut_down {
            return Vec::new();
        }

        match event {
            LinkEvent::Start => match self.phase {
                Phase::Idle | Phase::Exhausted => {
                    self.phase = Phase::Connecting;
                    self.retries = 0;
                    vec![
                        Effect::OpenConnection,
                        Effect::SetStatus(LinkStatus::Connecting),
                    ]
                }
                _ => Vec::new(),
            },

            LinkEvent::ConnAck => {
                let reconnected = self.retries > 0;
                self.phase = Phase::Connected;
                self.retries = 0;
                let message = if reconnected {
                    "reconnected to broker".to_string()
                } else {
                    "connected to broker".to_string()
                };
                vec![
                    Effect::Subscribe,
                    Effect::SetStatus(LinkStatus::Connected),
                    Effect::Notify(Level::Info, message),
                ]
            }

            // Degraded but still connected: warn, no transition.
            LinkEvent::SubscribeFailed(reason) => {
                vec![Effect::Notify(
                    Level::Warn,
                    format!("telemetry subscription failed: {reason}"),
                )]
            }

            LinkEvent::ConnectionLost(reason) => match self.phase {
                Phase::Connecting | Phase::Connected => {
                    if self.retries >= MAX_RETRY_ATTEMPTS {
                        self.phase = Phase::Exhausted;
                        return vec![
                            Effect::CloseConnection,
                            Effect::SetStatus(LinkStatus::Exhausted),
                            Effect::Notify(
                                Level::Error,
                                format!(
                                    "giving up after {MAX_RETRY_ATTEMPTS} reconnect attempts; \
                                     restart the dashboard to reconnect"
                                ),
                            ),
                        ];
                    }
                    let delay = retry_delay(self.retries);
                    self.retries += 1;
                    self.phase = Phase::Reconnecting;
                    vec![
                        Effect::CloseConnection,
                        Effect::ScheduleRetry(delay),
                        Effect::SetStatus(LinkStatus::Reconnecting {
                            attempt: self.retries,
                        }),
                        Effect::Notify(
                            Level::Warn,
                            format!(
                                "broker link lost ({reason}); retry {}/{} in {}ms",
                                self.retries,
                                MAX_RETRY_ATTEMPTS,
                                delay.as_millis()
                            ),
                        ),
                    ]
                }
                Phase::Idle | Phase::Reconnecting | Phase::Exhausted => Vec::new(),
            },

            LinkEvent::RetryDue => match self.phase {
                Phase::Reconnecting => {
                    self.phase = Phase::Connecting;
                    vec![
                        Effect::OpenConnection,
                        Effect::SetStatus(LinkStatus::Connecting),
                    ]
                }
                _ => Vec::new(),
            },

            LinkEvent::Shutdown => {
                self.shut_down = true;
                self.phase = Phase::Idle;
                vec![
                    Effect::CancelRetry,
                    Effect::CloseConnection,
                    Effect::SetStatus(LinkStatus::Disconnected),
                ]
            }
        }
    }
}

/// Exponential backoff: `initial * 2^retry_count`, capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(retry_count: u32) -> Duration {
    let initial = INITIAL_RETRY_DELAY.as_millis() as u64;
    let cap = MAX_RETRY_DELAY.as_millis() as u64;
    let factor = 1u64 << retry_count.min(16);
    Duration::from_millis(initial.saturating_mul(factor).min(cap))
}

// ===========================================================================
// Tests
// ===========================================================================
