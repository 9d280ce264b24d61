//! `DetectionSession`: the capture → classify → detect chain behind one
//! start/stop pair.
//!
//! ## Lifecycle
//!
//! ```text
//! DetectionSession::new()
//!     └─► start(episode)   → worker spawned, returns at once
//!         ├─► DetectionOpened { episode, Ok(format) | Err(reason) }
//!         └─► stop()       → running=false; worker tears down and exits
//!             └─► start(episode + 1) …
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so `AudioCapture` is opened *inside* the worker
//! thread and dropped there. `start()` never waits for the device: a small
//! `tapwake-detect-open` thread waits at most `open_timeout_ms` for the
//! worker's open result and forwards it as a [`DetectionOpened`] message.
//!
//! `stop()` only signals. The worker finishes its current window, resets the
//! classifier, stops the capture and finally releases the device, in that
//! order. The next worker joins its predecessor before it opens anything, so
//! two sessions never share the model or the input. Any dismissal a stopped
//! worker sends carries the old episode id and is ignored by the controller.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc as sync_mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, warn};

use crate::{
    audio::{permission::MicrophonePermission, AudioCapture, AudioFormat, InputSource},
    buffering::{create_audio_ring, frame::FrameAssembler, frame::FRAME_SAMPLES},
    classify::{ModelHandle, SoundClassifier},
    detect::{DismissalConfig, DismissalDetector, DismissalEvent, EpisodeId},
    error::{Result, TapwakeError},
    ipc::events::ClassificationEvent,
};

pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};

/// Broadcast channel capacity for classification events.
const BROADCAST_CAP: usize = 256;

/// Poll interval while a new worker waits for the previous one to exit.
const RELEASE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub source: InputSource,
    /// Samples per frame cut from the ring.
    pub frame_samples: usize,
    /// Fraction of each analysis window shared with the next, `[0, 0.9]`.
    pub window_overlap: f32,
    /// Inference slower than this is logged and counted.
    pub latency_budget_ms: u64,
    /// Buffered frames beyond this are skipped so analysis stays current.
    pub max_backlog_frames: usize,
    /// Upper bound on releasing the previous session plus opening the input.
    pub open_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            source: InputSource::default(),
            frame_samples: FRAME_SAMPLES,
            window_overlap: 0.5,
            latency_budget_ms: 250,
            max_backlog_frames: 32,
            open_timeout_ms: 3_000,
        }
    }
}

/// Outcome of opening the input for one episode, delivered after
/// [`DetectionChain::start`] has returned.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOpened {
    pub episode: EpisodeId,
    pub result: std::result::Result<AudioFormat, String>,
}

/// What the alarm controller needs from a listener.
///
/// Dismissals and [`DetectionOpened`] results are delivered on channels
/// fixed at construction; `start` arms the chain for one episode.
pub trait DetectionChain {
    /// Must not block on device I/O. Errors that are known up front (a
    /// denied permission) are returned here; everything else arrives later
    /// as a failed [`DetectionOpened`].
    ///
    /// # Errors
    /// Any error leaves the chain inactive; the caller keeps ringing.
    fn start(&mut self, episode: EpisodeId) -> Result<()>;

    /// Idempotent; safe when never started.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

pub struct DetectionSession {
    config: DetectionConfig,
    dismissal: DismissalConfig,
    model: ModelHandle,
    permission: MicrophonePermission,
    dismissal_tx: mpsc::UnboundedSender<DismissalEvent>,
    opened_tx: mpsc::UnboundedSender<DetectionOpened>,
    classification_tx: broadcast::Sender<ClassificationEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    /// Per-session flag; a fresh one is created on every start.
    running: Option<Arc<AtomicBool>>,
    /// Latest worker. Each worker joins the one before it.
    worker: Option<JoinHandle<()>>,
    warmed_up: bool,
}

impl DetectionSession {
    pub fn new(
        config: DetectionConfig,
        dismissal: DismissalConfig,
        model: ModelHandle,
        permission: MicrophonePermission,
        dismissal_tx: mpsc::UnboundedSender<DismissalEvent>,
        opened_tx: mpsc::UnboundedSender<DetectionOpened>,
    ) -> Self {
        let (classification_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            dismissal,
            model,
            permission,
            dismissal_tx,
            opened_tx,
            classification_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            running: None,
            worker: None,
            warmed_up: false,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn subscribe_classifications(&self) -> broadcast::Receiver<ClassificationEvent> {
        self.classification_tx.subscribe()
    }

    /// Counters for the current (or last) session.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Load the model ahead of the first alarm so the first window is fast.
    pub fn warm_up(&mut self) -> Result<()> {
        if self.warmed_up {
            return Ok(());
        }
        info!("warming up sound model");
        self.model.0.lock().warm_up()?;
        self.warmed_up = true;
        Ok(())
    }
}

/// Wait until `previous` has exited or `budget` runs out, then join it.
///
/// Returns `false` when the budget ran out. The join still happens, so the
/// caller never outlives its predecessor.
fn release_previous(previous: JoinHandle<()>, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while !previous.is_finished() && Instant::now() < deadline {
        std::thread::sleep(RELEASE_POLL);
    }
    let released = previous.is_finished();
    if !released {
        warn!("previous detection worker still draining after {budget:?}");
    }
    if previous.join().is_err() {
        warn!("previous detection worker panicked");
    }
    released
}

impl DetectionChain for DetectionSession {
    fn start(&mut self, episode: EpisodeId) -> Result<()> {
        if self.is_active() {
            return Err(TapwakeError::AudioStream(
                "detection session already running".into(),
            ));
        }
        if matches!(self.config.source, InputSource::Microphone { .. }) {
            self.permission.ensure()?;
        }
        self.warm_up()?;

        let running = Arc::new(AtomicBool::new(true));
        let (producer, consumer) = create_audio_ring();
        let timeout = Duration::from_millis(self.config.open_timeout_ms.max(1));

        let config = self.config.clone();
        let mut detector = DismissalDetector::new(self.dismissal.clone());
        detector.reset(episode);
        let model = self.model.clone();
        let permission = self.permission;
        let previous = self.worker.take();
        let worker_running = Arc::clone(&running);
        let dismissal_tx = self.dismissal_tx.clone();
        let classification_tx = self.classification_tx.clone();
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        let (open_tx, open_rx) = sync_mpsc::channel::<std::result::Result<AudioFormat, String>>();

        let handle = std::thread::Builder::new()
            .name("tapwake-detect".into())
            .spawn(move || {
                let span = info_span!("detection", episode);
                let _enter = span.enter();
                let report = |result: std::result::Result<AudioFormat, String>| {
                    if open_tx.send(result).is_err() {
                        debug!("open result arrived after the timeout");
                    }
                };

                if let Some(previous) = previous {
                    if !release_previous(previous, timeout) {
                        worker_running.store(false, Ordering::SeqCst);
                        report(Err(
                            "previous detection session still releasing the input".into(),
                        ));
                        return;
                    }
                }
                if !worker_running.load(Ordering::SeqCst) {
                    debug!("stopped before the input was opened");
                    return;
                }
                diagnostics.reset();

                // Must happen on this thread: cpal::Stream is !Send.
                let mut capture = match AudioCapture::open(
                    &config.source,
                    producer,
                    Arc::clone(&worker_running),
                    &permission,
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        worker_running.store(false, Ordering::SeqCst);
                        report(Err(e.to_string()));
                        return;
                    }
                };
                let format = capture.format;

                let classifier =
                    match SoundClassifier::new(model, format.sample_rate, config.window_overlap) {
                        Ok(c) => c,
                        Err(e) => {
                            worker_running.store(false, Ordering::SeqCst);
                            if let Err(stop_err) = capture.stop() {
                                warn!("{stop_err}");
                            }
                            report(Err(e.to_string()));
                            return;
                        }
                    };
                report(Ok(format));

                let assembler = FrameAssembler::new(format, config.frame_samples);
                let mut classifier = pipeline::run(pipeline::PipelineContext {
                    config,
                    episode,
                    classifier,
                    detector,
                    assembler,
                    consumer,
                    running: worker_running,
                    dismissal_tx,
                    classification_tx,
                    seq,
                    diagnostics: Arc::clone(&diagnostics),
                });

                classifier.reset();
                if let Err(e) = capture.stop() {
                    warn!("{e}");
                }
                drop(capture);
                let snap = diagnostics.snapshot();
                info!(
                    frames_in = snap.frames_in,
                    frames_dropped = snap.frames_dropped,
                    windows_analyzed = snap.windows_analyzed,
                    classification_errors = snap.classification_errors,
                    slow_windows = snap.slow_windows,
                    dismissals_emitted = snap.dismissals_emitted,
                    "detection session ended"
                );
            })
            .map_err(TapwakeError::Io)?;
        self.worker = Some(handle);

        let opened_tx = self.opened_tx.clone();
        let watch_running = Arc::clone(&running);
        let spawned = std::thread::Builder::new()
            .name("tapwake-detect-open".into())
            .spawn(move || {
                let result = match open_rx.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(sync_mpsc::RecvTimeoutError::Timeout) => {
                        watch_running.store(false, Ordering::SeqCst);
                        Err(format!("input did not open within {} ms", timeout.as_millis()))
                    }
                    Err(sync_mpsc::RecvTimeoutError::Disconnected) => {
                        watch_running.store(false, Ordering::SeqCst);
                        Err("detection worker exited before opening the input".into())
                    }
                };
                match &result {
                    Ok(format) => info!(
                        episode,
                        sample_rate = format.sample_rate,
                        channels = format.channels,
                        "listening for dismissal sound"
                    ),
                    Err(reason) => warn!(episode, "detection failed to start: {reason}"),
                }
                if opened_tx.send(DetectionOpened { episode, result }).is_err() {
                    debug!(episode, "open result dropped, controller gone");
                }
            });
        if let Err(e) = spawned {
            running.store(false, Ordering::SeqCst);
            return Err(TapwakeError::Io(e));
        }

        self.running = Some(running);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::SeqCst);
            info!("detection stop requested");
        }
    }

    fn is_active(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.load(Ordering::SeqCst))
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("detection worker panicked during shutdown");
            }
        }
    }
}
