//! Blocking classification worker loop.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Skip backlog beyond max_backlog_frames (keep the newest frame)
//! 2. Cut one frame from the ring; sleep briefly if none is ready
//! 3. SoundClassifier::analyze → zero or one outcome
//! 4. Failure → log + count, keep listening
//!    Classification → DismissalDetector::observe
//!                     → broadcast ClassificationEvent
//!                     → send DismissalEvent to the controller (once)
//! ```
//!
//! Runs on its own OS thread, off the audio callback and the controller.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    buffering::{frame::FrameAssembler, AudioConsumer, Observer},
    classify::{ClassificationOutcome, SoundClassifier},
    detect::{DismissalDetector, DismissalEvent, EpisodeId},
    engine::DetectionConfig,
    ipc::events::ClassificationEvent,
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub windows_analyzed: AtomicUsize,
    pub classification_errors: AtomicUsize,
    pub slow_windows: AtomicUsize,
    pub dismissals_emitted: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.windows_analyzed.store(0, Ordering::Relaxed);
        self.classification_errors.store(0, Ordering::Relaxed);
        self.slow_windows.store(0, Ordering::Relaxed);
        self.dismissals_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            windows_analyzed: self.windows_analyzed.load(Ordering::Relaxed),
            classification_errors: self.classification_errors.load(Ordering::Relaxed),
            slow_windows: self.slow_windows.load(Ordering::Relaxed),
            dismissals_emitted: self.dismissals_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_dropped: usize,
    pub windows_analyzed: usize,
    pub classification_errors: usize,
    pub slow_windows: usize,
    pub dismissals_emitted: usize,
}

/// Everything the worker owns for one episode.
pub struct PipelineContext {
    pub config: DetectionConfig,
    pub episode: EpisodeId,
    pub classifier: SoundClassifier,
    pub detector: DismissalDetector,
    pub assembler: FrameAssembler,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub dismissal_tx: mpsc::UnboundedSender<DismissalEvent>,
    pub classification_tx: broadcast::Sender<ClassificationEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Sleep when less than a frame is buffered.
const EMPTY_SLEEP_MS: u64 = 5;

/// Run until `ctx.running` clears. Hands the classifier back for teardown.
pub fn run(mut ctx: PipelineContext) -> SoundClassifier {
    info!(episode = ctx.episode, "classification worker started");

    let frame_len = ctx.assembler.frame_len();
    let backlog_limit = frame_len * ctx.config.max_backlog_frames.max(1);
    let budget = Duration::from_millis(ctx.config.latency_budget_ms);

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        if ctx.consumer.occupied_len() > backlog_limit {
            let dropped = ctx.assembler.drop_backlog(&mut ctx.consumer, frame_len);
            ctx.diagnostics
                .frames_dropped
                .fetch_add(dropped / frame_len, Ordering::Relaxed);
            warn!(dropped_samples = dropped, "classifier fell behind, skipped stale audio");
        }

        let Some(frame) = ctx.assembler.next_frame(&mut ctx.consumer) else {
            std::thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        };
        ctx.diagnostics.frames_in.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let Some(outcome) = ctx.classifier.analyze(&frame) else {
            continue;
        };
        let elapsed = started.elapsed();
        ctx.diagnostics
            .windows_analyzed
            .fetch_add(1, Ordering::Relaxed);
        if elapsed > budget {
            ctx.diagnostics.slow_windows.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = ctx.config.latency_budget_ms,
                "window inference exceeded latency budget"
            );
        }

        match outcome {
            ClassificationOutcome::Failure { reason } => {
                ctx.diagnostics
                    .classification_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(position = frame.position, "classification failed: {reason}");
            }
            ClassificationOutcome::Classification(result) => {
                let dismissal = ctx.detector.observe(&result);
                let matched = ctx.detector.config().matches(&result);
                debug!(
                    label = %result.label,
                    confidence = result.confidence,
                    matched,
                    at_secs = frame.timestamp().as_secs_f32(),
                    "window classified"
                );
                let _ = ctx.classification_tx.send(ClassificationEvent {
                    seq: ctx.seq.fetch_add(1, Ordering::Relaxed),
                    episode: ctx.episode,
                    label: result.label,
                    confidence: result.confidence,
                    matched,
                });

                if let Some(event) = dismissal {
                    ctx.diagnostics
                        .dismissals_emitted
                        .fetch_add(1, Ordering::Relaxed);
                    if ctx.dismissal_tx.send(event).is_err() {
                        debug!("dismissal receiver dropped");
                    }
                }
            }
        }
    }

    info!(episode = ctx.episode, "classification worker stopping");
    ctx.classifier
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::audio::AudioFormat;
    use crate::buffering::{create_audio_ring_with_capacity, Producer};
    use crate::classify::{ClassificationResult, FixedLabelModel, ModelHandle, SoundModel};
    use crate::detect::DismissalConfig;
    use crate::error::{Result, TapwakeError};

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 16_000,
        channels: 1,
    };

    struct FailingModel;

    impl SoundModel for FailingModel {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn window_len(&self) -> usize {
            1_024
        }
        fn classify(&mut self, _window: &[f32]) -> Result<Vec<ClassificationResult>> {
            Err(TapwakeError::Classification("intentional test failure".into()))
        }
        fn reset(&mut self) {}
    }

    struct Harness {
        running: Arc<AtomicBool>,
        diagnostics: Arc<PipelineDiagnostics>,
        dismissal_rx: mpsc::UnboundedReceiver<DismissalEvent>,
        classification_rx: broadcast::Receiver<ClassificationEvent>,
        worker: thread::JoinHandle<SoundClassifier>,
    }

    fn spawn(model: ModelHandle, samples: &[f32], config: DetectionConfig) -> Harness {
        let (mut producer, consumer) = create_audio_ring_with_capacity(1 << 17);
        producer.push_slice(samples);

        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let (dismissal_tx, dismissal_rx) = mpsc::unbounded_channel();
        let (classification_tx, classification_rx) = broadcast::channel(1_024);
        let mut detector = DismissalDetector::new(DismissalConfig::default());
        detector.reset(5);

        let ctx = PipelineContext {
            assembler: FrameAssembler::new(FORMAT, config.frame_samples),
            classifier: SoundClassifier::new(model, FORMAT.sample_rate, 0.0).expect("classifier"),
            config,
            episode: 5,
            detector,
            consumer,
            running: Arc::clone(&running),
            dismissal_tx,
            classification_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };
        Harness {
            running,
            diagnostics,
            dismissal_rx,
            classification_rx,
            worker: thread::spawn(move || run(ctx)),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn shutdown(h: Harness) -> DiagnosticsSnapshot {
        h.running.store(false, Ordering::SeqCst);
        h.worker.join().expect("worker join");
        h.diagnostics.snapshot()
    }

    #[test]
    fn matching_windows_send_exactly_one_dismissal() {
        let model = ModelHandle::new(FixedLabelModel::new("water", 0.9).with_window(16_000, 1_024));
        let mut h = spawn(model, &vec![0.2; 8 * 1_024], DetectionConfig::default());

        let mut got = None;
        assert!(wait_until(Duration::from_secs(2), || {
            got = h.dismissal_rx.try_recv().ok();
            got.is_some()
        }));
        assert_eq!(got, Some(DismissalEvent { episode: 5 }));

        let diagnostics = Arc::clone(&h.diagnostics);
        assert!(wait_until(Duration::from_secs(2), || {
            diagnostics.snapshot().windows_analyzed == 8
        }));
        assert!(h.dismissal_rx.try_recv().is_err(), "latched after the first match");

        let event = h.classification_rx.try_recv().expect("classification event");
        assert_eq!(event.episode, 5);
        assert!(event.matched);

        let snap = shutdown(h);
        assert_eq!(snap.dismissals_emitted, 1);
        assert_eq!(snap.frames_in, 8);
    }

    #[test]
    fn below_threshold_never_dismisses() {
        let model = ModelHandle::new(FixedLabelModel::new("water", 0.5).with_window(16_000, 1_024));
        let mut h = spawn(model, &vec![0.2; 4 * 1_024], DetectionConfig::default());

        let diagnostics = Arc::clone(&h.diagnostics);
        assert!(wait_until(Duration::from_secs(2), || {
            diagnostics.snapshot().windows_analyzed == 4
        }));
        assert!(h.dismissal_rx.try_recv().is_err());
        let event = h.classification_rx.try_recv().expect("classification event");
        assert!(!event.matched);
        shutdown(h);
    }

    #[test]
    fn failures_are_counted_and_listening_continues() {
        let mut h = spawn(
            ModelHandle::new(FailingModel),
            &vec![0.2; 3 * 1_024],
            DetectionConfig::default(),
        );
        let diagnostics = Arc::clone(&h.diagnostics);
        assert!(wait_until(Duration::from_secs(2), || {
            diagnostics.snapshot().classification_errors == 3
        }));
        assert!(h.dismissal_rx.try_recv().is_err());
        let snap = shutdown(h);
        assert_eq!(snap.windows_analyzed, 3);
        assert_eq!(snap.dismissals_emitted, 0);
    }

    #[test]
    fn backlog_beyond_limit_is_skipped() {
        let config = DetectionConfig {
            max_backlog_frames: 4,
            ..DetectionConfig::default()
        };
        let model = ModelHandle::new(FixedLabelModel::new("speech", 0.9).with_window(16_000, 1_024));
        let h = spawn(model, &vec![0.2; 20 * 1_024], config);

        let diagnostics = Arc::clone(&h.diagnostics);
        assert!(wait_until(Duration::from_secs(2), || {
            diagnostics.snapshot().frames_in >= 1
        }));
        let snap = shutdown(h);
        assert_eq!(snap.frames_dropped, 19);
        assert_eq!(snap.frames_in, 1);
    }

    #[test]
    fn stop_flag_returns_the_classifier() {
        let model = ModelHandle::new(FixedLabelModel::new("water", 0.9));
        let h = spawn(model, &[], DetectionConfig::default());
        let snap = shutdown(h);
        assert_eq!(snap.frames_in, 0);
    }
}
