//! `AlarmController`: sole owner of "is the alarm sounding".
//!
//! ## Episode model
//!
//! ```text
//! start()  → episode += 1, tone on, detection.start(episode) → Starting
//! DetectionOpened { episode } == current → Listening | Unavailable
//! DismissalEvent { episode } == current && firing → stop()
//! DismissalEvent from an older episode            → ignored
//! stop()   → tone off + rewound, detection.stop()
//! ```
//!
//! Every mutation happens on the thread that owns the controller, and none of
//! them wait on audio hardware. Failures of the tone or the detection chain
//! are logged and reflected in the published status; they never change
//! `firing`.

use chrono::NaiveTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{format_hhmm, AlarmConfig, AlarmScheduler, Intent, SchedulerPhase};
use crate::{
    detect::{DismissalEvent, EpisodeId},
    engine::{DetectionChain, DetectionOpened},
    ipc::events::{AlarmStatusEvent, DetectionStatus},
    playback::TonePlayer,
};

const BROADCAST_CAP: usize = 64;

pub struct AlarmController<T: TonePlayer, D: DetectionChain> {
    tone: T,
    detection: D,
    config: Option<AlarmConfig>,
    scheduler: AlarmScheduler,
    firing: bool,
    episode: EpisodeId,
    detection_status: DetectionStatus,
    /// Last tick seen, for phase reporting between ticks.
    last_tick: Option<NaiveTime>,
    status_tx: broadcast::Sender<AlarmStatusEvent>,
    seq: u64,
}

impl<T: TonePlayer, D: DetectionChain> AlarmController<T, D> {
    pub fn new(tone: T, detection: D) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            tone,
            detection,
            config: None,
            scheduler: AlarmScheduler::new(),
            firing: false,
            episode: 0,
            detection_status: DetectionStatus::Inactive,
            last_tick: None,
            status_tx,
            seq: 0,
        }
    }

    /// Replace the alarm. Clears the re-fire latch.
    pub fn set_alarm(&mut self, trigger: NaiveTime, enabled: bool) {
        let config = AlarmConfig::new(trigger, enabled);
        info!(trigger = %format_hhmm(config.trigger()), enabled, "alarm set");
        self.config = Some(config);
        self.scheduler.reset_latch();
        self.publish(None);
    }

    /// Toggle the current alarm. Stopping a ringing alarm happens on the
    /// next tick.
    pub fn set_enabled(&mut self, enabled: bool) {
        match self.config.as_mut() {
            Some(config) if config.enabled != enabled => {
                config.enabled = enabled;
                info!(enabled, "alarm toggled");
                self.publish(None);
            }
            Some(_) => {}
            None => debug!(enabled, "toggle ignored, no alarm set"),
        }
    }

    pub fn is_firing(&self) -> bool {
        self.firing
    }

    pub fn current_trigger_time(&self) -> Option<NaiveTime> {
        self.config.map(|c| c.trigger())
    }

    pub fn config(&self) -> Option<&AlarmConfig> {
        self.config.as_ref()
    }

    pub fn episode(&self) -> EpisodeId {
        self.episode
    }

    pub fn detection_status(&self) -> &DetectionStatus {
        &self.detection_status
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler
            .phase(self.config.as_ref(), self.last_tick, self.firing)
    }

    /// Drive the scheduler with the current wall-clock time and apply the
    /// resulting intent.
    pub fn on_tick(&mut self, now: NaiveTime) -> Option<Intent> {
        self.last_tick = Some(now);
        let intent = self.scheduler.on_tick(self.config.as_ref(), now);
        match intent {
            Some(Intent::Start) => self.start(),
            Some(Intent::Stop) => self.stop(),
            None => {}
        }
        intent
    }

    /// Returns whether the event stopped the alarm.
    pub fn handle_dismissal(&mut self, event: DismissalEvent) -> bool {
        if !self.firing || event.episode != self.episode {
            debug!(
                event_episode = event.episode,
                current_episode = self.episode,
                firing = self.firing,
                "stale dismissal ignored"
            );
            return false;
        }
        info!(episode = event.episode, "alarm dismissed by sound");
        self.stop();
        true
    }

    pub fn start(&mut self) {
        if self.firing {
            return;
        }
        self.firing = true;
        self.episode += 1;
        info!(episode = self.episode, "alarm firing");

        let mut detail = None;
        if let Err(e) = self.tone.start() {
            warn!("alarm tone failed to start: {e}");
            detail = Some(e.to_string());
        }

        self.detection_status = match self.detection.start(self.episode) {
            Ok(()) => DetectionStatus::Starting,
            Err(e) => {
                warn!(
                    fatal = e.is_detection_fatal(),
                    "alarm cannot be dismissed by sound: {e}"
                );
                DetectionStatus::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        self.publish(detail);
    }

    /// Apply the open result for an episode. Returns whether the status
    /// changed; results for an earlier episode are ignored.
    pub fn handle_detection_opened(&mut self, event: DetectionOpened) -> bool {
        if !self.firing
            || event.episode != self.episode
            || self.detection_status != DetectionStatus::Starting
        {
            debug!(
                event_episode = event.episode,
                current_episode = self.episode,
                firing = self.firing,
                "stale open result ignored"
            );
            return false;
        }
        self.detection_status = match event.result {
            Ok(format) => {
                debug!(
                    episode = event.episode,
                    sample_rate = format.sample_rate,
                    "detection listening"
                );
                DetectionStatus::Listening
            }
            Err(reason) => {
                warn!("alarm cannot be dismissed by sound: {reason}");
                self.detection.stop();
                DetectionStatus::Unavailable { reason }
            }
        };
        self.publish(None);
        true
    }

    pub fn stop(&mut self) {
        if !self.firing {
            return;
        }
        self.firing = false;
        self.tone.stop();
        self.detection.stop();
        self.detection_status = DetectionStatus::Inactive;
        info!(episode = self.episode, "alarm stopped");
        self.publish(None);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<AlarmStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Current state as an event, without publishing it.
    pub fn status(&self) -> AlarmStatusEvent {
        AlarmStatusEvent {
            seq: self.seq,
            phase: self.phase(),
            firing: self.firing,
            detection: self.detection_status.clone(),
            trigger_time: self.current_trigger_time().map(format_hhmm),
            detail: None,
        }
    }

    pub fn tone(&self) -> &T {
        &self.tone
    }

    pub fn detection(&self) -> &D {
        &self.detection
    }

    fn publish(&mut self, detail: Option<String>) {
        self.seq += 1;
        let event = AlarmStatusEvent {
            detail,
            ..self.status()
        };
        let _ = self.status_tx.send(event);
    }
}

impl<T: TonePlayer, D: DetectionChain> Drop for AlarmController<T, D> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::error::{Result, TapwakeError};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeTone {
        starts: usize,
        stops: usize,
        playing: bool,
        fail: bool,
    }

    impl TonePlayer for FakeTone {
        fn start(&mut self) -> Result<()> {
            self.starts += 1;
            if self.fail {
                return Err(TapwakeError::Playback("no output device".into()));
            }
            self.playing = true;
            Ok(())
        }
        fn stop(&mut self) {
            self.stops += 1;
            self.playing = false;
        }
        fn is_playing(&self) -> bool {
            self.playing
        }
    }

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 1,
    };

    #[derive(Default)]
    struct FakeDetection {
        started: Vec<EpisodeId>,
        stops: usize,
        active: bool,
        deny: bool,
        /// When set, each start reports `Ok(FORMAT)` from another thread
        /// after this long, like a slow device.
        slow_open: Option<(Duration, mpsc::UnboundedSender<DetectionOpened>)>,
    }

    impl DetectionChain for FakeDetection {
        fn start(&mut self, episode: EpisodeId) -> Result<()> {
            self.started.push(episode);
            if self.deny {
                return Err(TapwakeError::PermissionDenied);
            }
            self.active = true;
            if let Some((delay, tx)) = &self.slow_open {
                let (delay, tx) = (*delay, tx.clone());
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    let _ = tx.send(DetectionOpened {
                        episode,
                        result: Ok(FORMAT),
                    });
                });
            }
            Ok(())
        }
        fn stop(&mut self) {
            self.stops += 1;
            self.active = false;
        }
        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    fn controller() -> AlarmController<FakeTone, FakeDetection> {
        AlarmController::new(FakeTone::default(), FakeDetection::default())
    }

    fn opened(episode: EpisodeId) -> DetectionOpened {
        DetectionOpened {
            episode,
            result: Ok(FORMAT),
        }
    }

    #[test]
    fn start_twice_does_not_restart_playback_or_listener() {
        let mut c = controller();
        c.start();
        c.start();
        assert!(c.is_firing());
        assert_eq!(c.tone().starts, 1);
        assert_eq!(c.detection().started, vec![1]);
    }

    #[test]
    fn stop_is_idempotent_and_safe_when_idle() {
        let mut c = controller();
        c.stop();
        assert_eq!(c.tone().stops, 0);
        c.start();
        c.stop();
        c.stop();
        assert!(!c.is_firing());
        assert_eq!(c.tone().stops, 1);
        assert_eq!(c.detection().stops, 1);
        assert!(!c.tone().is_playing());
        assert!(!c.detection().is_active());
    }

    #[test]
    fn stale_dismissal_after_stop_is_ignored() {
        let mut c = controller();
        c.start();
        let first = DismissalEvent {
            episode: c.episode(),
        };
        c.stop();
        assert!(!c.handle_dismissal(first));

        c.start();
        assert!(c.is_firing());
        assert!(!c.handle_dismissal(first), "episode 1 event during episode 2");
        assert!(c.is_firing());
        assert!(c.handle_dismissal(DismissalEvent { episode: 2 }));
        assert!(!c.is_firing());
    }

    #[test]
    fn permission_denied_keeps_ringing_and_reports_unavailable() {
        let mut c = AlarmController::new(
            FakeTone::default(),
            FakeDetection {
                deny: true,
                ..FakeDetection::default()
            },
        );
        let mut rx = c.subscribe_status();
        c.start();
        assert!(c.is_firing());
        assert!(c.tone().is_playing());
        let event = rx.try_recv().expect("status event");
        assert!(event.firing);
        assert!(matches!(event.detection, DetectionStatus::Unavailable { .. }));
    }

    #[test]
    fn tone_failure_leaves_firing_consistent() {
        let mut c = AlarmController::new(
            FakeTone {
                fail: true,
                ..FakeTone::default()
            },
            FakeDetection::default(),
        );
        let mut rx = c.subscribe_status();
        c.start();
        assert!(c.is_firing());
        assert!(c.detection().is_active());
        let event = rx.try_recv().expect("status event");
        assert!(event.detail.as_deref().unwrap_or_default().contains("no output device"));
        c.stop();
        assert!(!c.is_firing());
    }

    #[test]
    fn toggle_without_alarm_is_a_no_op() {
        let mut c = controller();
        let mut rx = c.subscribe_status();
        c.set_enabled(true);
        assert!(c.config().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_reports_trigger_and_phase() {
        let mut c = controller();
        c.set_alarm(hm(7, 30), true);
        c.on_tick(hm(7, 29));
        let status = c.status();
        assert_eq!(status.trigger_time.as_deref(), Some("07:30"));
        assert_eq!(status.phase, SchedulerPhase::Armed);
        c.on_tick(hm(7, 30));
        assert_eq!(c.status().phase, SchedulerPhase::Fired);
        assert_eq!(c.status().detection, DetectionStatus::Starting);
        assert!(c.handle_detection_opened(opened(1)));
        assert_eq!(c.status().detection, DetectionStatus::Listening);
    }

    #[test]
    fn slow_input_open_does_not_hold_up_the_tick() {
        let (tx, mut opened_rx) = mpsc::unbounded_channel();
        let mut c = AlarmController::new(
            FakeTone::default(),
            FakeDetection {
                slow_open: Some((Duration::from_millis(400), tx)),
                ..FakeDetection::default()
            },
        );
        c.set_alarm(hm(6, 0), true);

        let tick = Instant::now();
        assert_eq!(c.on_tick(hm(6, 0)), Some(Intent::Start));
        assert!(
            tick.elapsed() < Duration::from_millis(100),
            "tick took {:?}",
            tick.elapsed()
        );
        assert!(c.is_firing());
        assert!(c.tone().is_playing());
        assert_eq!(c.detection_status(), &DetectionStatus::Starting);

        // The next tick is not delayed either.
        let tick = Instant::now();
        assert_eq!(c.on_tick(hm(6, 0)), None);
        assert!(tick.elapsed() < Duration::from_millis(100));

        let event = opened_rx.blocking_recv().expect("open result");
        assert!(c.handle_detection_opened(event));
        assert_eq!(c.detection_status(), &DetectionStatus::Listening);
    }

    #[test]
    fn late_open_failure_reports_unavailable_and_releases_the_listener() {
        let mut c = controller();
        let mut rx = c.subscribe_status();
        c.start();
        assert_eq!(
            rx.try_recv().expect("starting").detection,
            DetectionStatus::Starting
        );

        assert!(c.handle_detection_opened(DetectionOpened {
            episode: 1,
            result: Err("input did not open within 3000 ms".into()),
        }));
        assert!(c.is_firing(), "still ringing");
        assert!(!c.detection().is_active());
        let event = rx.try_recv().expect("unavailable");
        assert_eq!(
            event.detection,
            DetectionStatus::Unavailable {
                reason: "input did not open within 3000 ms".into()
            }
        );
    }

    #[test]
    fn open_result_from_an_earlier_episode_is_ignored() {
        let mut c = controller();
        c.start();
        c.stop();
        assert!(!c.handle_detection_opened(opened(1)), "not firing");

        c.start();
        assert!(!c.handle_detection_opened(opened(1)), "episode 1 result during episode 2");
        assert_eq!(c.detection_status(), &DetectionStatus::Starting);
        assert!(c.handle_detection_opened(opened(2)));
        assert!(!c.handle_detection_opened(opened(2)), "applied once");
        assert_eq!(c.detection_status(), &DetectionStatus::Listening);
    }
}
