//! Alarm state machine: when to ring and when to stop.
//!
//! `AlarmScheduler` compares the wall-clock minute with the configured
//! trigger and produces `Intent`s. `AlarmController` is the only owner of the
//! firing state; it applies intents and dismissals to the tone and the
//! detection chain.

pub mod controller;
pub mod scheduler;

pub use controller::AlarmController;
pub use scheduler::AlarmScheduler;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// The single configured alarm. Seconds are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmConfig {
    trigger: NaiveTime,
    pub enabled: bool,
}

impl AlarmConfig {
    pub fn new(trigger: NaiveTime, enabled: bool) -> Self {
        Self {
            trigger: truncate_to_minute(trigger),
            enabled,
        }
    }

    pub fn trigger(&self) -> NaiveTime {
        self.trigger
    }

    /// Whether `now` falls in the trigger minute.
    pub fn matches(&self, now: NaiveTime) -> bool {
        truncate_to_minute(now) == self.trigger
    }
}

/// What the scheduler wants the controller to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    /// No alarm, or the alarm is disabled.
    Idle,
    /// Waiting for the trigger minute (or already fired this session).
    Armed,
    /// In the trigger minute and not yet fired.
    Matching,
    /// Ringing.
    Fired,
}

pub fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// `HH:MM` as shown to users.
pub fn format_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}
