use thiserror::Error;

/// All errors produced by tapwake-core.
#[derive(Debug, Error)]
pub enum TapwakeError {
    #[error("microphone access was denied")]
    PermissionDenied,

    #[error("no audio input device found")]
    NoInputDevice,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("unusable audio format: {sample_rate} Hz, {channels} channel(s)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("classification error: {0}")]
    Classification(String),

    #[error("audio session teardown failed: {0}")]
    SessionDeactivation(String),

    #[error("tone playback error: {0}")]
    Playback(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("WAV file error: {0}")]
    WavFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TapwakeError {
    /// Errors that prevent the detection chain from starting.
    ///
    /// The alarm keeps ringing when one of these occurs; it just cannot be
    /// dismissed by sound.
    pub fn is_detection_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::NoInputDevice
                | Self::AudioDevice(_)
                | Self::UnsupportedFormat { .. }
                | Self::AudioStream(_)
                | Self::WavFile(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TapwakeError>;
