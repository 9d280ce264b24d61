//! Sound classification.
//!
//! The `SoundModel` trait decouples the worker from any specific backend
//! (fixed-label stub, the built-in spectral detector, an ONNX audio event
//! model). `classify` takes `&mut self` because backends keep scratch
//! buffers and sessions; all calls are serialised through `ModelHandle`.
//!
//! `SoundClassifier` sits in front of the model: it resamples capture-rate
//! frames to the model rate, accumulates them into analysis windows and
//! surfaces only the top label per window.

pub mod spectral;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxSoundModel, OnnxSoundModelConfig};
pub use spectral::SpectralWaterModel;
pub use stub::FixedLabelModel;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio::resample::RateConverter;
use crate::buffering::frame::{AudioFrame, FRAME_SAMPLES};
use crate::error::Result;

/// One labelled score from a sound model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// What one analysis window produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Classification(ClassificationResult),
    Failure { reason: String },
}

/// Contract for sound classification backends.
pub trait SoundModel: Send + 'static {
    /// Load weights and run a dummy inference. Called once per session start.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Rate the model's windows are expected at, in Hz.
    fn sample_rate(&self) -> u32;

    /// Samples per analysis window at [`SoundModel::sample_rate`].
    fn window_len(&self) -> usize;

    /// Score one window. Results are in the model's output order, which
    /// decides ties.
    fn classify(&mut self, window: &[f32]) -> Result<Vec<ClassificationResult>>;

    /// Drop any state carried between windows.
    fn reset(&mut self);
}

/// Shared handle to any `SoundModel`.
///
/// `parking_lot::Mutex` does not poison, so a panicking backend cannot wedge
/// later sessions.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn SoundModel>>);

impl ModelHandle {
    pub fn new<M: SoundModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Highest-confidence result; the earliest wins a tie. NaN scores are ignored
/// and confidences are clamped to `[0, 1]`.
pub fn top_result(results: Vec<ClassificationResult>) -> Option<ClassificationResult> {
    let mut best: Option<ClassificationResult> = None;
    for result in results {
        if result.confidence.is_nan() {
            continue;
        }
        let replace = best
            .as_ref()
            .map_or(true, |b| result.confidence > b.confidence);
        if replace {
            best = Some(result);
        }
    }
    best.map(|mut r| {
        r.confidence = r.confidence.clamp(0.0, 1.0);
        r
    })
}

/// Frame-to-window adapter in front of a `SoundModel`.
pub struct SoundClassifier {
    model: ModelHandle,
    converter: RateConverter,
    pending: Vec<f32>,
    window_len: usize,
    hop: usize,
    model_rate: u32,
}

impl SoundClassifier {
    /// `overlap` is the fraction of each window shared with the next one,
    /// clamped to `[0, 0.9]`.
    ///
    /// # Errors
    /// Fails if a resampler from `capture_rate` to the model rate cannot be
    /// built.
    pub fn new(model: ModelHandle, capture_rate: u32, overlap: f32) -> Result<Self> {
        let (model_rate, window_len) = {
            let guard = model.0.lock();
            (guard.sample_rate(), guard.window_len().max(1))
        };
        let converter = RateConverter::new(capture_rate, model_rate, FRAME_SAMPLES)?;
        let overlap = if overlap.is_finite() {
            overlap.clamp(0.0, 0.9)
        } else {
            0.0
        };
        let hop = ((window_len as f32 * (1.0 - overlap)).round() as usize).clamp(1, window_len);
        Ok(Self {
            model,
            converter,
            pending: Vec::with_capacity(window_len * 2),
            window_len,
            hop,
            model_rate,
        })
    }

    /// Feed one frame; classify at most one window.
    ///
    /// When several windows became ready at once (the worker fell behind),
    /// only the newest is analysed and the older ones are dropped.
    pub fn analyze(&mut self, frame: &AudioFrame) -> Option<ClassificationOutcome> {
        let converted = self.converter.process(&frame.samples);
        self.pending.extend_from_slice(&converted);
        if self.pending.len() < self.window_len {
            return None;
        }

        let stale = (self.pending.len() - self.window_len) / self.hop * self.hop;
        if stale > 0 {
            tracing::debug!(stale_samples = stale, "skipping stale analysis windows");
            self.pending.drain(..stale);
        }

        let scored = self.model.0.lock().classify(&self.pending[..self.window_len]);
        self.pending.drain(..self.hop);

        match scored {
            Ok(results) => top_result(results).map(ClassificationOutcome::Classification),
            Err(e) => Some(ClassificationOutcome::Failure {
                reason: e.to_string(),
            }),
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.converter.reset();
        self.model.0.lock().reset();
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs_f64(self.window_len as f64 / self.model_rate.max(1) as f64)
    }

    pub fn hop_len(&self) -> usize {
        self.hop
    }
}
