//! Audio capture: the microphone (cpal) or a replayed WAV file.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It only downmixes to mono and pushes into the SPSC ring; it never
//! classifies, locks or performs I/O.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` therefore must be created and dropped on the same
//! thread. The detection session does both on its classification worker.

pub mod device;
pub mod permission;
pub mod resample;
pub mod wav;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "audio-cpal")]
use tracing::error;

use crate::{
    buffering::{frame::FRAME_SAMPLES, AudioProducer, Observer, Producer},
    error::{Result, TapwakeError},
};
use permission::MicrophonePermission;

/// Negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Reject formats the device reported but nothing can be built on.
    pub fn validate(self) -> Result<Self> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(TapwakeError::UnsupportedFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
            });
        }
        Ok(self)
    }
}

/// Where detection audio comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum InputSource {
    /// Live microphone. `None` picks the system default input.
    Microphone { preferred_device: Option<String> },
    /// Replay a WAV file through the same ring/worker path.
    /// `realtime` paces pushes at the file's sample rate.
    Wav { path: PathBuf, realtime: bool },
}

impl Default for InputSource {
    fn default() -> Self {
        Self::Microphone {
            preferred_device: None,
        }
    }
}

enum CaptureBackend {
    #[cfg(feature = "audio-cpal")]
    Device(Stream),
    Replay(Option<JoinHandle<()>>),
}

/// Handle to an active capture.
///
/// **Not `Send`** when backed by a device stream. Create and drop it on the
/// same OS thread.
pub struct AudioCapture {
    backend: CaptureBackend,
    /// Cleared to detach the tap: the callback no-ops from then on.
    running: Arc<AtomicBool>,
    stopped: bool,
    /// Format reported by the device (or the WAV header).
    pub format: AudioFormat,
}

impl AudioCapture {
    /// Start pushing mono f32 samples from `source` into `producer`.
    ///
    /// # Errors
    /// - `PermissionDenied` when microphone access was refused.
    /// - `NoInputDevice` / `AudioDevice` / `AudioStream` on device failures.
    /// - `UnsupportedFormat` for a zero sample rate or channel count.
    /// - `WavFile` when a replay file cannot be read.
    pub fn open(
        source: &InputSource,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        permission: &MicrophonePermission,
    ) -> Result<Self> {
        match source {
            InputSource::Microphone { preferred_device } => {
                permission.ensure()?;
                Self::open_device(producer, running, preferred_device.as_deref())
            }
            InputSource::Wav { path, realtime } => {
                Self::open_replay(path, *realtime, producer, running)
            }
        }
    }

    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one.
    #[cfg(feature = "audio-cpal")]
    fn open_device(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let mut selected = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices
                        .find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false));
                    if selected.is_none() {
                        warn!(preferred_name, "preferred input device not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
            }
        }

        let device = match selected.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| TapwakeError::AudioDevice(e.to_string()))?;
                warn!("no default input device, falling back to first available input");
                devices.next().ok_or(TapwakeError::NoInputDevice)?
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device.default_input_config().map_err(|e| {
            let msg = e.to_string();
            if permission::looks_like_permission_error(&msg) {
                TapwakeError::PermissionDenied
            } else {
                TapwakeError::AudioDevice(msg)
            }
        })?;

        let format = AudioFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        }
        .validate()?;
        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "capture format negotiated"
        );

        let config = stream_config(format);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_downmix_stream::<f32>(&device, &config, producer, &running),
            SampleFormat::F64 => build_downmix_stream::<f64>(&device, &config, producer, &running),
            SampleFormat::I16 => build_downmix_stream::<i16>(&device, &config, producer, &running),
            SampleFormat::I32 => build_downmix_stream::<i32>(&device, &config, producer, &running),
            SampleFormat::U16 => build_downmix_stream::<u16>(&device, &config, producer, &running),
            SampleFormat::U8 => build_downmix_stream::<u8>(&device, &config, producer, &running),
            other => {
                return Err(TapwakeError::AudioStream(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| TapwakeError::AudioStream(e.to_string()))?;

        Ok(Self {
            backend: CaptureBackend::Device(stream),
            running,
            stopped: false,
            format,
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn open_device(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(TapwakeError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open_replay(
        path: &std::path::Path,
        realtime: bool,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (samples, format) = wav::load_mono(path)?;
        info!(
            path = %path.display(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            samples = samples.len(),
            realtime,
            "replaying WAV input"
        );

        let pace = Duration::from_secs_f64(FRAME_SAMPLES as f64 / format.sample_rate as f64);
        let feeder_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("tapwake-wav-replay".into())
            .spawn(move || {
                for block in samples.chunks(FRAME_SAMPLES) {
                    // Back-pressure instead of dropping: replay is not realtime-bound.
                    while producer.vacant_len() < block.len() {
                        if !feeder_running.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    if !feeder_running.load(Ordering::Relaxed) {
                        return;
                    }
                    producer.push_slice(block);
                    if realtime {
                        std::thread::sleep(pace);
                    }
                }
                debug!("WAV replay reached end of file");
            })
            .map_err(TapwakeError::Io)?;

        Ok(Self {
            backend: CaptureBackend::Replay(Some(handle)),
            running,
            stopped: false,
            format,
        })
    }

    /// Detach the tap and halt the stream.
    ///
    /// Idempotent. The device itself is released when `self` drops.
    ///
    /// # Errors
    /// `SessionDeactivation` if the stream refuses to pause or the replay
    /// thread panicked. Callers log it and carry on.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.running.store(false, Ordering::Release);

        match &mut self.backend {
            #[cfg(feature = "audio-cpal")]
            CaptureBackend::Device(stream) => stream
                .pause()
                .map_err(|e| TapwakeError::SessionDeactivation(e.to_string())),
            CaptureBackend::Replay(handle) => match handle.take() {
                Some(handle) => handle.join().map_err(|_| {
                    TapwakeError::SessionDeactivation("WAV replay thread panicked".into())
                }),
                None => Ok(()),
            },
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("capture teardown on drop: {e}");
        }
    }
}

/// The host picks the callback size; `FrameAssembler` cuts exact frames on
/// the worker. WASAPI and CoreAudio reject fixed sizes they do not support.
#[cfg(feature = "audio-cpal")]
fn stream_config(format: AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

#[cfg(feature = "audio-cpal")]
fn build_downmix_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let running = Arc::clone(running);
    let mut mix_buf: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mix_buf.resize(frames, 0.0);
                for (out, frame) in mix_buf.iter_mut().zip(data.chunks_exact(channels)) {
                    let sum: f32 = frame
                        .iter()
                        .map(|s| <f32 as FromSample<T>>::from_sample_(*s))
                        .sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} samples", mix_buf.len() - written);
                }
            },
            |err| error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| TapwakeError::AudioStream(e.to_string()))
}
