//! WAV helpers shared by the replay input source, the benchmark and tests.

use std::path::Path;

use super::AudioFormat;
use crate::error::{Result, TapwakeError};

/// Read a WAV file fully and average its channels to mono f32.
///
/// Returns the samples and the file's original format (channel count before
/// downmix).
pub fn load_mono(path: &Path) -> Result<(Vec<f32>, AudioFormat)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| TapwakeError::WavFile(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    let format = AudioFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    }
    .validate()?;
    let channels = usize::from(spec.channels);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TapwakeError::WavFile(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = match spec.bits_per_sample {
                0..=8 => i8::MAX as f32,
                9..=16 => i16::MAX as f32,
                17..=24 => 8_388_607.0,
                _ => i32::MAX as f32,
            };
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| TapwakeError::WavFile(e.to_string()))?
        }
    };

    let mono = if channels <= 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, format))
}

/// Write mono f32 samples as a 32-bit float WAV.
pub fn write_mono(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| TapwakeError::WavFile(format!("{}: {e}", path.display())))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| TapwakeError::WavFile(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| TapwakeError::WavFile(e.to_string()))
}
