//! `FixedLabelModel`: a backend that always reports the same score.
//!
//! Drives demos (`--model stub`) and end-to-end tests without real audio
//! analysis. Windows quieter than `min_rms` report `silence` instead, so a
//! muted microphone never dismisses the alarm.

use tracing::debug;

use super::{ClassificationResult, SoundModel};
use crate::error::Result;

pub struct FixedLabelModel {
    label: String,
    confidence: f32,
    min_rms: f32,
    sample_rate: u32,
    window_len: usize,
    windows_seen: u64,
}

impl FixedLabelModel {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            min_rms: 0.0,
            sample_rate: 16_000,
            window_len: 4_096,
            windows_seen: 0,
        }
    }

    /// Report `silence` for windows below this RMS.
    pub fn with_min_rms(mut self, min_rms: f32) -> Self {
        self.min_rms = min_rms;
        self
    }

    pub fn with_window(mut self, sample_rate: u32, window_len: usize) -> Self {
        self.sample_rate = sample_rate;
        self.window_len = window_len.max(1);
        self
    }

    pub fn windows_seen(&self) -> u64 {
        self.windows_seen
    }
}

impl SoundModel for FixedLabelModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!(label = %self.label, "FixedLabelModel::warm_up, no-op");
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_len(&self) -> usize {
        self.window_len
    }

    fn classify(&mut self, window: &[f32]) -> Result<Vec<ClassificationResult>> {
        self.windows_seen += 1;
        if self.min_rms > 0.0 {
            let energy = window.iter().map(|s| s * s).sum::<f32>() / window.len().max(1) as f32;
            if energy.sqrt() < self.min_rms {
                return Ok(vec![ClassificationResult::new("silence", 1.0)]);
            }
        }
        Ok(vec![ClassificationResult::new(
            self.label.clone(),
            self.confidence,
        )])
    }

    fn reset(&mut self) {
        self.windows_seen = 0;
    }
}
