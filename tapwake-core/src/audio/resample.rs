//! Capture-rate to model-rate conversion with rubato.
//!
//! Microphones usually run at 44.1 or 48 kHz while sound models expect a
//! fixed rate (16 kHz for the bundled ones). Conversion happens on the
//! classification worker, never in the audio callback. Equal rates skip
//! rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{Result, TapwakeError};

pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `chunk_size` is the number of input samples fed to rubato per call.
    ///
    /// # Errors
    /// `UnsupportedFormat` for a zero rate, `Classification` if rubato
    /// rejects the ratio.
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == 0 || target_rate == 0 {
            return Err(TapwakeError::UnsupportedFormat {
                sample_rate: capture_rate.min(target_rate),
                channels: 1,
            });
        }
        let chunk_size = chunk_size.max(1);
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / capture_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| TapwakeError::Classification(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        info!(capture_rate, target_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    /// Convert `samples`, returning whatever complete output is available.
    /// Leftover input is carried into the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let block = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }
        out
    }

    /// Drop buffered input and filter state. Used between detection sessions.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
