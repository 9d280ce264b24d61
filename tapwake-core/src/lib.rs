//! # tapwake-core
//!
//! An alarm that only stops when it hears running water.
//!
//! ## Architecture
//!
//! ```text
//! Microphone / WAV → AudioCapture → SPSC RingBuffer → classification worker
//!                                                        │
//!                                         FrameAssembler (1024-sample frames)
//!                                                        │
//!                                      SoundClassifier (resample → window → model)
//!                                                        │
//!                                        DismissalDetector (labels, threshold)
//!                                                        │
//!                                       mpsc::UnboundedSender<DismissalEvent>
//!                                                        │
//! 1 Hz tick → AlarmScheduler → AlarmController ◄─────────┘
//!                                  │
//!                      TonePlayer + DetectionChain start/stop
//! ```
//!
//! The audio callback only downmixes and pushes. Inference happens on the
//! worker; every alarm-state mutation happens on the controller's thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod alarm;
pub mod audio;
pub mod buffering;
pub mod classify;
pub mod detect;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;

// Convenience re-exports for downstream crates
pub use alarm::{AlarmConfig, AlarmController, AlarmScheduler, Intent, SchedulerPhase};
pub use audio::{permission::MicrophonePermission, AudioFormat, InputSource};
pub use classify::{
    ClassificationOutcome, ClassificationResult, FixedLabelModel, ModelHandle, SoundClassifier,
    SoundModel, SpectralWaterModel,
};
pub use detect::{DismissalConfig, DismissalDetector, DismissalEvent, EpisodeId};
pub use engine::{DetectionChain, DetectionConfig, DetectionOpened, DetectionSession};
pub use error::TapwakeError;
pub use ipc::events::{AlarmStatusEvent, ClassificationEvent, DetectionStatus};
pub use playback::{AlarmTone, TonePlayer, ToneSource};

#[cfg(feature = "onnx")]
pub use classify::{OnnxSoundModel, OnnxSoundModelConfig};
