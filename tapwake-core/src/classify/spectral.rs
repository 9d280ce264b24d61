//! Built-in running-water detector that needs no model files.
//!
//! Running water is broadband, steady noise. Each window is cut into Hann
//! windowed sub-frames; the averaged magnitude spectrum gives spectral
//! flatness over the band where tap noise lives, and the spread of sub-frame
//! RMS gives stationarity. The water score is the product of three terms:
//!
//! | Term        | 0 at                       | 1 at                     |
//! |-------------|----------------------------|--------------------------|
//! | flatness    | `FLATNESS_FLOOR` (tonal)   | `FLATNESS_FULL` (noise)  |
//! | level       | `SILENCE_DBFS`             | `SILENCE_DBFS + LEVEL_SPAN_DB` |
//! | stationarity| RMS variation `MAX_RMS_CV` | constant RMS             |
//!
//! Speech and music fail the flatness or stationarity term. Faint hiss
//! scores low through the level term.
//!
//! ## False dismissals
//!
//! The score cannot tell a tap from any other steady broadband noise at a
//! normal level. A fan, a shower, a white-noise machine or loud ventilation
//! near the microphone can dismiss the alarm. Where that matters, use the
//! `onnx` backend, which scores the `water_tap_faucet` class itself, and
//! raise `dismissal_threshold` towards 0.9.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use super::{ClassificationResult, SoundModel};
use crate::error::Result;

pub const WATER_LABEL: &str = "water_tap_faucet";
pub const BACKGROUND_LABEL: &str = "background";
pub const SILENCE_LABEL: &str = "silence";

const SAMPLE_RATE: u32 = 16_000;
/// 0.512 s at 16 kHz.
const WINDOW_LEN: usize = 8_192;
const FFT_SIZE: usize = 512;
const SUB_HOP: usize = 256;

const BAND_LOW_HZ: f32 = 200.0;
const BAND_HIGH_HZ: f32 = 7_000.0;

const FLATNESS_FLOOR: f32 = 0.3;
const FLATNESS_FULL: f32 = 0.7;
const SILENCE_DBFS: f32 = -50.0;
const LEVEL_SPAN_DB: f32 = 20.0;
const MAX_RMS_CV: f32 = 0.5;

/// Features extracted from one window, exposed for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterFeatures {
    pub level_dbfs: f32,
    pub flatness: f32,
    pub rms_variation: f32,
}

impl WaterFeatures {
    pub fn water_score(&self) -> f32 {
        let flatness = ((self.flatness - FLATNESS_FLOOR) / (FLATNESS_FULL - FLATNESS_FLOOR))
            .clamp(0.0, 1.0);
        let level = ((self.level_dbfs - SILENCE_DBFS) / LEVEL_SPAN_DB).clamp(0.0, 1.0);
        let stationarity = (1.0 - self.rms_variation / MAX_RMS_CV).clamp(0.0, 1.0);
        flatness * level * stationarity
    }
}

pub struct SpectralWaterModel {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    band: std::ops::Range<usize>,
}

impl SpectralWaterModel {
    pub fn new() -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let hann = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0
                    - ((2.0 * std::f32::consts::PI * i as f32) / (FFT_SIZE as f32 - 1.0)).cos())
            })
            .collect();
        let bin_hz = SAMPLE_RATE as f32 / FFT_SIZE as f32;
        let low = (BAND_LOW_HZ / bin_hz).ceil() as usize;
        let high = ((BAND_HIGH_HZ / bin_hz).floor() as usize).min(FFT_SIZE / 2);
        Self {
            fft,
            hann,
            scratch: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            band: low..high + 1,
        }
    }

    pub fn features(&mut self, window: &[f32]) -> WaterFeatures {
        let mut mean_spectrum = vec![0f32; FFT_SIZE / 2 + 1];
        let mut sub_rms = Vec::with_capacity(window.len() / SUB_HOP + 1);

        let mut start = 0;
        while start + FFT_SIZE <= window.len() {
            let sub = &window[start..start + FFT_SIZE];
            sub_rms.push(rms(sub));
            for ((slot, &s), &w) in self.scratch.iter_mut().zip(sub).zip(&self.hann) {
                *slot = Complex::new(s * w, 0.0);
            }
            self.fft.process(&mut self.scratch);
            for (acc, c) in mean_spectrum.iter_mut().zip(&self.scratch) {
                *acc += c.norm();
            }
            start += SUB_HOP;
        }

        let level_dbfs = 20.0 * rms(window).max(1e-9).log10();
        WaterFeatures {
            level_dbfs,
            flatness: flatness(&mean_spectrum[self.band.clone()]),
            rms_variation: coefficient_of_variation(&sub_rms),
        }
    }
}

impl Default for SpectralWaterModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundModel for SpectralWaterModel {
    fn warm_up(&mut self) -> Result<()> {
        let _ = self.features(&vec![0.0; WINDOW_LEN]);
        debug!("spectral water model ready");
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn window_len(&self) -> usize {
        WINDOW_LEN
    }

    fn classify(&mut self, window: &[f32]) -> Result<Vec<ClassificationResult>> {
        let features = self.features(window);
        if features.level_dbfs < SILENCE_DBFS {
            return Ok(vec![ClassificationResult::new(SILENCE_LABEL, 1.0)]);
        }
        let score = features.water_score();
        debug!(
            level_dbfs = features.level_dbfs,
            flatness = features.flatness,
            rms_variation = features.rms_variation,
            score,
            "spectral features"
        );
        Ok(vec![
            ClassificationResult::new(WATER_LABEL, score),
            ClassificationResult::new(BACKGROUND_LABEL, 1.0 - score),
        ])
    }

    fn reset(&mut self) {}
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Geometric over arithmetic mean; 0 for tonal, 1 for white.
fn flatness(spectrum: &[f32]) -> f32 {
    let bins: Vec<f32> = spectrum.iter().copied().filter(|&m| m > 1e-10).collect();
    if bins.is_empty() {
        return 0.0;
    }
    let n = bins.len() as f32;
    let geometric = (bins.iter().map(|m| m.ln()).sum::<f32>() / n).exp();
    let arithmetic = bins.iter().sum::<f32>() / n;
    if arithmetic > 1e-10 {
        (geometric / arithmetic).min(1.0)
    } else {
        0.0
    }
}

fn coefficient_of_variation(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    if mean <= 1e-9 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    var.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn white_noise(amplitude: f32, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..WINDOW_LEN)
            .map(|_| rng.gen_range(-amplitude..amplitude))
            .collect()
    }

    fn sine(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..WINDOW_LEN)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin()
            })
            .collect()
    }

    fn top(results: &[ClassificationResult]) -> &ClassificationResult {
        results
            .iter()
            .fold(&results[0], |best, r| if r.confidence > best.confidence { r } else { best })
    }

    /// Anything this steady and flat passes, tap or not.
    #[test]
    fn steady_broadband_noise_reads_as_water() {
        let mut model = SpectralWaterModel::new();
        let results = model.classify(&white_noise(0.2, 7)).expect("classify");
        let water = &results[0];
        assert_eq!(water.label, WATER_LABEL);
        assert!(water.confidence > 0.75, "score {}", water.confidence);
    }

    #[test]
    fn faint_hiss_stays_below_the_default_threshold() {
        let mut model = SpectralWaterModel::new();
        // About -45 dBFS: above the silence floor, low on the level term.
        let results = model.classify(&white_noise(0.01, 3)).expect("classify");
        assert_eq!(results[0].label, WATER_LABEL);
        assert!(results[0].confidence < 0.5, "score {}", results[0].confidence);
    }

    #[test]
    fn pure_tone_is_background() {
        let mut model = SpectralWaterModel::new();
        let results = model.classify(&sine(880.0, 0.3)).expect("classify");
        assert_eq!(top(&results).label, BACKGROUND_LABEL);
        assert!(results[0].confidence < 0.1);
    }

    #[test]
    fn bursty_noise_loses_stationarity() {
        let mut model = SpectralWaterModel::new();
        let mut samples = white_noise(0.2, 11);
        for (i, s) in samples.iter_mut().enumerate() {
            if (i / 1_024) % 2 == 1 {
                *s *= 0.05;
            }
        }
        let features = model.features(&samples);
        assert!(features.rms_variation > MAX_RMS_CV);
        assert_eq!(features.water_score(), 0.0);
    }

    #[test]
    fn digital_silence_is_labelled() {
        let mut model = SpectralWaterModel::new();
        let results = model.classify(&vec![0.0; WINDOW_LEN]).expect("classify");
        assert_eq!(results, vec![ClassificationResult::new(SILENCE_LABEL, 1.0)]);
    }

    #[test]
    fn flatness_bounds() {
        approx::assert_abs_diff_eq!(flatness(&[1.0; 64]), 1.0, epsilon = 1e-6);
        let mut peaky = vec![1e-3; 64];
        peaky[10] = 100.0;
        assert!(flatness(&peaky) < 0.1);
        assert_eq!(flatness(&[]), 0.0);
    }
}
