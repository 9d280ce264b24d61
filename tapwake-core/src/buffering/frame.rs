//! Typed audio frames cut from the ring buffer on the worker thread.

use std::time::Duration;

use super::{AudioConsumer, Consumer, Observer};
use crate::audio::AudioFormat;

/// Samples per frame handed to the classifier.
pub const FRAME_SAMPLES: usize = 1024;

/// A contiguous block of mono PCM samples with its capture position.
///
/// Allocated on the worker thread, never on the audio callback.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0] (device channels averaged).
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count the device negotiated, before downmix.
    pub channel_count: u16,
    /// Index of the first sample since capture started.
    pub position: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, format: AudioFormat, position: u64) -> Self {
        Self {
            samples,
            sample_rate: format.sample_rate,
            channel_count: format.channels,
            position,
        }
    }

    /// Offset of this frame from the start of capture.
    pub fn timestamp(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.position as f64 / self.sample_rate as f64)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Cuts fixed-size frames out of the ring and tracks the capture position.
#[derive(Debug)]
pub struct FrameAssembler {
    format: AudioFormat,
    frame_len: usize,
    position: u64,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat, frame_len: usize) -> Self {
        Self {
            format,
            frame_len: frame_len.max(1),
            position: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples consumed so far, including skipped backlog.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Pop the next full frame, or `None` if less than a frame is buffered.
    pub fn next_frame(&mut self, consumer: &mut AudioConsumer) -> Option<AudioFrame> {
        if consumer.occupied_len() < self.frame_len {
            return None;
        }
        let mut samples = vec![0f32; self.frame_len];
        let n = consumer.pop_slice(&mut samples);
        samples.truncate(n);
        let frame = AudioFrame::new(samples, self.format, self.position);
        self.position += n as u64;
        Some(frame)
    }

    /// Discard everything beyond the newest `keep` samples.
    ///
    /// Returns the number of samples dropped. The position still advances so
    /// frame timestamps stay aligned with wall time.
    pub fn drop_backlog(&mut self, consumer: &mut AudioConsumer, keep: usize) -> usize {
        let buffered = consumer.occupied_len();
        if buffered <= keep {
            return 0;
        }
        let skipped = consumer.skip(buffered - keep);
        self.position += skipped as u64;
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_ring_with_capacity, Producer};

    fn mono_16k() -> AudioFormat {
        AudioFormat {
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[test]
    fn frames_carry_position_and_timestamp() {
        let (mut producer, mut consumer) = create_audio_ring_with_capacity(8_192);
        producer.push_slice(&vec![0.1; 2_500]);

        let mut assembler = FrameAssembler::new(mono_16k(), 1_000);
        let first = assembler.next_frame(&mut consumer).expect("first frame");
        let second = assembler.next_frame(&mut consumer).expect("second frame");

        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1_000);
        assert_eq!(second.timestamp(), Duration::from_millis(62) + Duration::from_micros(500));
        assert!(assembler.next_frame(&mut consumer).is_none(), "500 samples left over");
    }

    #[test]
    fn drop_backlog_keeps_newest_samples() {
        let (mut producer, mut consumer) = create_audio_ring_with_capacity(8_192);
        let samples: Vec<f32> = (0..4_000).map(|i| i as f32).collect();
        producer.push_slice(&samples);

        let mut assembler = FrameAssembler::new(mono_16k(), 1_000);
        let dropped = assembler.drop_backlog(&mut consumer, 1_000);
        assert_eq!(dropped, 3_000);
        assert_eq!(assembler.position(), 3_000);

        let frame = assembler.next_frame(&mut consumer).expect("newest frame");
        assert_eq!(frame.position, 3_000);
        assert_eq!(frame.samples[0], 3_000.0);
    }

    #[test]
    fn zero_rate_frame_has_zero_timestamp() {
        let frame = AudioFrame::new(
            vec![0.0; 4],
            AudioFormat {
                sample_rate: 0,
                channels: 1,
            },
            128,
        );
        assert_eq!(frame.timestamp(), Duration::ZERO);
        assert_eq!(frame.duration_secs(), 0.0);
    }
}
