//! Persistent settings (JSON file in the user config directory).
//!
//! The alarm itself is never stored; it lives only as long as `tapwake run`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tapwake_core::{DetectionConfig, DismissalConfig, InputSource, ToneSource};

pub const MODEL_SPECTRAL: &str = "spectral";
pub const MODEL_STUB: &str = "stub";
pub const MODEL_ONNX: &str = "onnx";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub tone_path: Option<PathBuf>,
    pub model: String,
    pub model_dir: Option<PathBuf>,
    pub dismissal_labels: Vec<String>,
    pub dismissal_threshold: f32,
    pub window_overlap: f32,
    pub latency_budget_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        let dismissal = DismissalConfig::default();
        let detection = DetectionConfig::default();
        Self {
            preferred_input_device: None,
            tone_path: None,
            model: MODEL_SPECTRAL.into(),
            model_dir: None,
            dismissal_labels: dismissal.labels,
            dismissal_threshold: dismissal.threshold,
            window_overlap: detection.window_overlap,
            latency_budget_ms: detection.latency_budget_ms,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.model = normalize_model(&self.model);
        self.dismissal_labels = normalize_labels(&self.dismissal_labels);
        if self.dismissal_labels.is_empty() {
            self.dismissal_labels = DismissalConfig::default().labels;
        }
        self.dismissal_threshold = if self.dismissal_threshold.is_finite() {
            self.dismissal_threshold.clamp(0.0, 1.0)
        } else {
            DismissalConfig::default().threshold
        };
        self.window_overlap = if self.window_overlap.is_finite() {
            self.window_overlap.clamp(0.0, 0.9)
        } else {
            DetectionConfig::default().window_overlap
        };
        self.latency_budget_ms = self.latency_budget_ms.clamp(10, 10_000);
        self.preferred_input_device = self
            .preferred_input_device
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    pub fn dismissal_config(&self) -> DismissalConfig {
        DismissalConfig {
            labels: self.dismissal_labels.clone(),
            threshold: self.dismissal_threshold,
        }
    }

    pub fn detection_config(&self, source: InputSource) -> DetectionConfig {
        DetectionConfig {
            source,
            window_overlap: self.window_overlap,
            latency_budget_ms: self.latency_budget_ms,
            ..DetectionConfig::default()
        }
    }

    pub fn tone_source(&self) -> ToneSource {
        match &self.tone_path {
            Some(path) => ToneSource::File { path: path.clone() },
            None => ToneSource::Builtin,
        }
    }
}

pub fn normalize_model(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        MODEL_STUB => MODEL_STUB.into(),
        MODEL_ONNX | "yamnet" => MODEL_ONNX.into(),
        _ => MODEL_SPECTRAL.into(),
    }
}

/// Trimmed, lowercased, first occurrence kept.
pub fn normalize_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim().to_ascii_lowercase();
        if !label.is_empty() && !out.contains(&label) {
            out.push(label);
        }
    }
    out
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tapwake")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("tapwake")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
