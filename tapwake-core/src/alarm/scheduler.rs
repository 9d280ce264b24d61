//! Minute matching with re-fire suppression.
//!
//! The latch is set when the alarm starts and is cleared only when the
//! scheduler is created (session start) or a new alarm is set. Leaving the
//! trigger minute does not clear it, so stepping the clock back into the
//! minute cannot ring a second time.

use chrono::NaiveTime;
use tracing::{debug, info};

use super::{AlarmConfig, Intent, SchedulerPhase};

#[derive(Debug, Default)]
pub struct AlarmScheduler {
    fired_this_match: bool,
}

impl AlarmScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one clock tick.
    pub fn on_tick(&mut self, config: Option<&AlarmConfig>, now: NaiveTime) -> Option<Intent> {
        let Some(config) = config.filter(|c| c.enabled) else {
            return Some(Intent::Stop);
        };
        if !config.matches(now) || self.fired_this_match {
            return None;
        }
        self.fired_this_match = true;
        info!(trigger = %super::format_hhmm(config.trigger()), "trigger minute reached");
        Some(Intent::Start)
    }

    /// Called when a new alarm is set.
    pub fn reset_latch(&mut self) {
        if self.fired_this_match {
            debug!("re-fire latch cleared");
        }
        self.fired_this_match = false;
    }

    pub fn is_latched(&self) -> bool {
        self.fired_this_match
    }

    /// `now` is the latest tick, if any has happened yet.
    pub fn phase(
        &self,
        config: Option<&AlarmConfig>,
        now: Option<NaiveTime>,
        firing: bool,
    ) -> SchedulerPhase {
        match config {
            None => SchedulerPhase::Idle,
            Some(c) if !c.enabled => SchedulerPhase::Idle,
            Some(_) if firing => SchedulerPhase::Fired,
            Some(c) if now.is_some_and(|t| c.matches(t)) && !self.fired_this_match => {
                SchedulerPhase::Matching
            }
            Some(_) => SchedulerPhase::Armed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[test]
    fn no_config_or_disabled_only_stops() {
        let mut scheduler = AlarmScheduler::new();
        assert_eq!(scheduler.on_tick(None, hm(8, 0)), Some(Intent::Stop));

        let disabled = AlarmConfig::new(hm(8, 0), false);
        for _ in 0..3 {
            assert_eq!(scheduler.on_tick(Some(&disabled), hm(8, 0)), Some(Intent::Stop));
        }
        assert!(!scheduler.is_latched());
    }

    #[test]
    fn sixty_ticks_in_the_trigger_minute_start_once() {
        let mut scheduler = AlarmScheduler::new();
        let config = AlarmConfig::new(hm(6, 30), true);
        let starts = (0..60)
            .filter_map(|s| {
                let now = NaiveTime::from_hms_opt(6, 30, s).expect("valid time");
                scheduler.on_tick(Some(&config), now)
            })
            .filter(|i| *i == Intent::Start)
            .count();
        assert_eq!(starts, 1);
        assert!(scheduler.is_latched());
    }

    #[test]
    fn leaving_the_minute_keeps_the_latch() {
        let mut scheduler = AlarmScheduler::new();
        let config = AlarmConfig::new(hm(8, 0), true);
        assert_eq!(scheduler.on_tick(Some(&config), hm(8, 0)), Some(Intent::Start));
        assert_eq!(scheduler.on_tick(Some(&config), hm(8, 1)), None);
        assert!(scheduler.is_latched());
        assert_eq!(
            scheduler.on_tick(Some(&config), hm(8, 0)),
            None,
            "clock stepped back into the minute"
        );
    }

    #[test]
    fn reset_latch_allows_a_new_start() {
        let mut scheduler = AlarmScheduler::new();
        let config = AlarmConfig::new(hm(8, 0), true);
        scheduler.on_tick(Some(&config), hm(8, 0));
        scheduler.reset_latch();
        assert!(!scheduler.is_latched());
        assert_eq!(scheduler.on_tick(Some(&config), hm(8, 0)), Some(Intent::Start));
    }

    #[test]
    fn phases_follow_config_and_latch() {
        let mut scheduler = AlarmScheduler::new();
        let config = AlarmConfig::new(hm(8, 0), true);
        assert_eq!(scheduler.phase(None, Some(hm(8, 0)), false), SchedulerPhase::Idle);
        assert_eq!(scheduler.phase(Some(&config), Some(hm(7, 59)), false), SchedulerPhase::Armed);
        assert_eq!(scheduler.phase(Some(&config), Some(hm(8, 0)), false), SchedulerPhase::Matching);
        scheduler.on_tick(Some(&config), hm(8, 0));
        assert_eq!(scheduler.phase(Some(&config), Some(hm(8, 0)), true), SchedulerPhase::Fired);
        assert_eq!(scheduler.phase(Some(&config), Some(hm(8, 0)), false), SchedulerPhase::Armed);
        let off = AlarmConfig::new(hm(8, 0), false);
        assert_eq!(scheduler.phase(Some(&off), Some(hm(8, 0)), false), SchedulerPhase::Idle);
    }
}
