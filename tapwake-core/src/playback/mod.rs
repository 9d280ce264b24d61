//! Alarm tone output.

#[cfg(feature = "playback-rodio")]
mod rodio_tone;

#[cfg(feature = "playback-rodio")]
pub use rodio_tone::AlarmTone;

#[cfg(not(feature = "playback-rodio"))]
mod silent;

#[cfg(not(feature = "playback-rodio"))]
pub use silent::AlarmTone;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the alarm plays, looped until stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ToneSource {
    /// Generated 880 Hz beeps.
    #[default]
    Builtin,
    /// Any format rodio can decode (wav, mp3, flac, ogg).
    File { path: PathBuf },
}

/// Looped tone playback driven by the alarm controller.
pub trait TonePlayer {
    /// Start from the beginning. A no-op while already playing.
    ///
    /// # Errors
    /// `Playback` when no output device can be opened or the source fails
    /// to decode.
    fn start(&mut self) -> Result<()>;

    /// Halt and rewind so the next `start` plays from the top.
    fn stop(&mut self);

    fn is_playing(&self) -> bool;
}
