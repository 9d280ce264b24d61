//! rodio-backed `TonePlayer`.
//!
//! The output stream is opened on `start` and released on `stop`, so the
//! audio device is only held while ringing. `OutputStream` is `!Send`: keep
//! the player on the thread that drives the controller.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use rodio::{source::SineWave, Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, info};

use super::{TonePlayer, ToneSource};
use crate::error::{Result, TapwakeError};

const BEEP_HZ: f32 = 880.0;
const BEEP_ON: Duration = Duration::from_millis(350);
const BEEP_GAP: Duration = Duration::from_millis(250);
const BEEP_GAIN: f32 = 0.3;

struct Output {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
}

pub struct AlarmTone {
    /// Decoded lazily from these bytes on every start, which rewinds it.
    file: Option<Arc<[u8]>>,
    output: Option<Output>,
}

impl AlarmTone {
    /// Load (and validate) the tone. Does not touch the output device.
    pub fn new(source: &ToneSource) -> Result<Self> {
        let file = match source {
            ToneSource::Builtin => None,
            ToneSource::File { path } => {
                let bytes: Arc<[u8]> = std::fs::read(path)
                    .map_err(|e| TapwakeError::Playback(format!("{}: {e}", path.display())))?
                    .into();
                Decoder::new(Cursor::new(Arc::clone(&bytes)))
                    .map_err(|e| TapwakeError::Playback(format!("{}: {e}", path.display())))?;
                info!(path = %path.display(), bytes = bytes.len(), "alarm tone loaded");
                Some(bytes)
            }
        };
        Ok(Self { file, output: None })
    }

    fn append_source(&self, sink: &Sink) -> Result<()> {
        match &self.file {
            Some(bytes) => {
                let looped = Decoder::new_looped(Cursor::new(Arc::clone(bytes)))
                    .map_err(|e| TapwakeError::Playback(e.to_string()))?;
                sink.append(looped);
            }
            None => {
                let beep = SineWave::new(BEEP_HZ)
                    .take_duration(BEEP_ON)
                    .amplify(BEEP_GAIN)
                    .delay(BEEP_GAP)
                    .repeat_infinite();
                sink.append(beep);
            }
        }
        Ok(())
    }
}

impl TonePlayer for AlarmTone {
    fn start(&mut self) -> Result<()> {
        if self.output.is_some() {
            return Ok(());
        }
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| TapwakeError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| TapwakeError::Playback(e.to_string()))?;
        self.append_source(&sink)?;
        sink.play();
        self.output = Some(Output {
            _stream: stream,
            _handle: handle,
            sink,
        });
        debug!("alarm tone playing");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(output) = self.output.take() {
            output.sink.stop();
            debug!("alarm tone stopped");
        }
    }

    fn is_playing(&self) -> bool {
        self.output.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builtin_tone_does_not_open_the_device_until_started() {
        let mut tone = AlarmTone::new(&ToneSource::Builtin).expect("builtin");
        assert!(!tone.is_playing());
        tone.stop();
        assert!(!tone.is_playing());
    }

    #[test]
    fn missing_tone_file_is_a_playback_error() {
        let source = ToneSource::File {
            path: PathBuf::from("/no/such/tone.wav"),
        };
        assert!(matches!(
            AlarmTone::new(&source),
            Err(TapwakeError::Playback(_))
        ));
    }

    #[test]
    fn wav_tone_file_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        crate::audio::wav::write_mono(&path, 16_000, &vec![0.1; 1_600]).expect("write");
        let tone = AlarmTone::new(&ToneSource::File { path }).expect("decodable");
        assert!(!tone.is_playing());
    }
}
