//! Microphone access check.
//!
//! Desktop platforms have no explicit permission prompt API reachable from
//! cpal; access is probed by asking the default input for its config, which
//! is where macOS and sandboxed Linux builds surface a refusal. The probe runs
//! once per process and the outcome is reused for every detection session.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TapwakeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrophoneAccess {
    Granted,
    Denied,
    /// No input device to ask, or the probe failed for another reason.
    Undetermined,
}

#[derive(Debug, Clone, Copy)]
pub struct MicrophonePermission {
    access: MicrophoneAccess,
}

static PROBED: OnceLock<MicrophoneAccess> = OnceLock::new();

impl MicrophonePermission {
    /// Probe microphone access. Later calls return the first answer.
    pub fn request() -> Self {
        let access = *PROBED.get_or_init(|| {
            let access = probe();
            match access {
                MicrophoneAccess::Denied => warn!("microphone access denied"),
                other => info!(access = ?other, "microphone access probed"),
            }
            access
        });
        Self { access }
    }

    pub fn granted() -> Self {
        Self {
            access: MicrophoneAccess::Granted,
        }
    }

    pub fn denied() -> Self {
        Self {
            access: MicrophoneAccess::Denied,
        }
    }

    pub fn access(&self) -> MicrophoneAccess {
        self.access
    }

    /// `Undetermined` is allowed through: the device open reports the real
    /// failure.
    pub fn ensure(&self) -> Result<()> {
        match self.access {
            MicrophoneAccess::Denied => Err(TapwakeError::PermissionDenied),
            _ => Ok(()),
        }
    }
}

/// Heuristic match on backend error text.
pub fn looks_like_permission_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "permission",
        "denied",
        "not permitted",
        "unauthorized",
        "not authorized",
        "eacces",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(feature = "audio-cpal")]
fn probe() -> MicrophoneAccess {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        return MicrophoneAccess::Undetermined;
    };
    match device.default_input_config() {
        Ok(_) => MicrophoneAccess::Granted,
        Err(e) if looks_like_permission_error(&e.to_string()) => MicrophoneAccess::Denied,
        Err(e) => {
            warn!("microphone probe failed: {e}");
            MicrophoneAccess::Undetermined
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn probe() -> MicrophoneAccess {
    MicrophoneAccess::Undetermined
}
