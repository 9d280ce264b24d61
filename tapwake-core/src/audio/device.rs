//! Input device enumeration for `tapwake devices` and `--device`.

use serde::{Deserialize, Serialize};

/// An input device as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDevice {
    pub name: String,
    pub is_default: bool,
    /// Monitors the system's own output rather than the room. Such a device
    /// hears the alarm tone but never the tap.
    pub is_monitor: bool,
}

const MONITOR_KEYWORDS: &[&str] = &[
    "monitor of",
    "loopback",
    "stereo mix",
    "what u hear",
    "what you hear",
    "wave out",
    "blackhole",
    "soundflower",
];

pub fn is_monitor_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    MONITOR_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order devices default first, room microphones before monitors, then by name.
pub fn sort_for_display(devices: &mut [InputDevice]) {
    devices.sort_by_key(|d| (!d.is_default, d.is_monitor, d.name.to_ascii_lowercase()));
}

/// Every input device the default host exposes.
///
/// Enumeration failures are logged and yield whatever the default device
/// alone can tell us.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<InputDevice> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut list = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input {}", idx + 1));
                InputDevice {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_monitor: is_monitor_name(&name),
                    name,
                }
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_name
                .map(|name| {
                    vec![InputDevice {
                        is_default: true,
                        is_monitor: is_monitor_name(&name),
                        name,
                    }]
                })
                .unwrap_or_default()
        }
    };
    sort_for_display(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<InputDevice> {
    vec![]
}
