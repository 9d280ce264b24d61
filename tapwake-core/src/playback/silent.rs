//! Stand-in `TonePlayer` for builds without `playback-rodio`: rings the
//! terminal bell once per start and otherwise only tracks state.

use std::io::Write;

use tracing::warn;

use super::{TonePlayer, ToneSource};
use crate::error::Result;

/// Write errors are logged only; the tone still counts as started.
fn ring_bell(out: &mut impl Write) {
    if let Err(e) = out.write_all(b"\x07").and_then(|()| out.flush()) {
        warn!("terminal bell failed: {e}");
    }
}

pub struct AlarmTone {
    playing: bool,
}

impl AlarmTone {
    pub fn new(source: &ToneSource) -> Result<Self> {
        if let ToneSource::File { path } = source {
            warn!(path = %path.display(), "built without playback-rodio, tone file ignored");
        }
        Ok(Self { playing: false })
    }
}

impl TonePlayer for AlarmTone {
    fn start(&mut self) -> Result<()> {
        if !self.playing {
            ring_bell(&mut std::io::stderr());
            self.playing = true;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.playing = false;
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}
