//! YAMNet-style audio event classifier via the `ort` crate.
//!
//! ## Model I/O
//!
//! | Name       | Shape                   | DType | Direction |
//! |------------|-------------------------|-------|-----------|
//! | `waveform` | `[15600]` or `[1,15600]`| f32   | in        |
//! | `scores`   | `[frames, classes]`     | f32   | out       |
//!
//! The waveform is 0.975 s of 16 kHz mono in `[-1, 1]`. Frame scores are
//! averaged into one score per class. Class names come from the companion
//! CSV (`index,mid,display_name`) and are normalised to snake_case, so
//! `"Water tap, faucet"` is reported as `water_tap_faucet`.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{debug, info, warn};

use super::{ClassificationResult, SoundModel};
use crate::error::{Result, TapwakeError};

const SAMPLE_RATE: u32 = 16_000;
const WINDOW_LEN: usize = 15_600;

pub struct OnnxSoundModelConfig {
    pub model_path: PathBuf,
    pub class_map_path: PathBuf,
}

impl Default for OnnxSoundModelConfig {
    fn default() -> Self {
        let dir = default_models_dir();
        Self {
            model_path: dir.join("yamnet.onnx"),
            class_map_path: dir.join("yamnet_class_map.csv"),
        }
    }
}

impl OnnxSoundModelConfig {
    /// Both files live in `dir` under their default names.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            model_path: dir.join("yamnet.onnx"),
            class_map_path: dir.join("yamnet_class_map.csv"),
        }
    }
}

/// `$TAPWAKE_MODEL_DIR`, else the platform data dir.
pub fn default_models_dir() -> PathBuf {
    if let Some(explicit) = std::env::var_os("TAPWAKE_MODEL_DIR") {
        if !explicit.is_empty() {
            return PathBuf::from(explicit);
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("tapwake").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("tapwake")
            .join("models")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaveformRank {
    Flat,
    Batched,
}

pub struct OnnxSoundModel {
    session: Session,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
    /// Resolved on the first successful run.
    rank: Option<WaveformRank>,
}

impl OnnxSoundModel {
    pub fn new(config: &OnnxSoundModelConfig) -> Result<Self> {
        for path in [&config.model_path, &config.class_map_path] {
            if !path.exists() {
                return Err(TapwakeError::ModelNotFound { path: path.clone() });
            }
        }

        let labels = parse_class_map(&std::fs::read_to_string(&config.class_map_path)?)?;

        let session = SessionBuilder::new()
            .map_err(|e| TapwakeError::OnnxSession(e.to_string()))?
            .commit_from_file(&config.model_path)
            .map_err(|e| TapwakeError::OnnxSession(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let input_name = resolve_name(&input_names, &["waveform", "audio", "input"])
            .or_else(|| input_names.first().cloned())
            .ok_or_else(|| TapwakeError::OnnxSession("sound model has no inputs".into()))?;
        let output_name = resolve_name(&output_names, &["scores", "output_0", "output"])
            .or_else(|| output_names.first().cloned())
            .ok_or_else(|| TapwakeError::OnnxSession("sound model has no outputs".into()))?;

        info!(
            path = %config.model_path.display(),
            classes = labels.len(),
            input = %input_name,
            output = %output_name,
            "ONNX sound model loaded"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            labels,
            rank: None,
        })
    }

    fn run_scores(&mut self, window: &[f32], rank: WaveformRank) -> Result<Vec<f32>> {
        let input_val = match rank {
            WaveformRank::Flat => Value::from_array(Array1::<f32>::from_vec(window.to_vec()))
                .map_err(|e: ort::Error| TapwakeError::OnnxSession(e.to_string()))?
                .into_dyn(),
            WaveformRank::Batched => {
                let arr = Array2::<f32>::from_shape_vec((1, window.len()), window.to_vec())
                    .map_err(|e| TapwakeError::OnnxSession(e.to_string()))?;
                Value::from_array(arr)
                    .map_err(|e: ort::Error| TapwakeError::OnnxSession(e.to_string()))?
                    .into_dyn()
            }
        };
        let input_values: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), input_val.into())];

        let outputs = self
            .session
            .run(input_values)
            .map_err(|e| TapwakeError::OnnxSession(e.to_string()))?;
        let scores = outputs
            .get(self.output_name.as_str())
            .unwrap_or(&outputs[0]);
        let (_, data) = scores
            .try_extract_tensor::<f32>()
            .map_err(|e| TapwakeError::OnnxSession(e.to_string()))?;
        Ok(data.to_vec())
    }
}

impl SoundModel for OnnxSoundModel {
    fn warm_up(&mut self) -> Result<()> {
        let started = std::time::Instant::now();
        self.classify(&vec![0.0; WINDOW_LEN])?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ONNX sound model warm-up done"
        );
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn window_len(&self) -> usize {
        WINDOW_LEN
    }

    fn classify(&mut self, window: &[f32]) -> Result<Vec<ClassificationResult>> {
        let data = match self.rank {
            Some(rank) => self.run_scores(window, rank)?,
            None => match self.run_scores(window, WaveformRank::Flat) {
                Ok(data) => {
                    self.rank = Some(WaveformRank::Flat);
                    data
                }
                Err(flat_err) => {
                    debug!("flat waveform rejected ({flat_err}), retrying batched");
                    let data = self.run_scores(window, WaveformRank::Batched)?;
                    self.rank = Some(WaveformRank::Batched);
                    data
                }
            },
        };

        let means = average_frames(&data, self.labels.len()).ok_or_else(|| {
            TapwakeError::Classification(format!(
                "score tensor of {} values does not divide into {} classes",
                data.len(),
                self.labels.len()
            ))
        })?;
        Ok(self
            .labels
            .iter()
            .zip(means)
            .map(|(label, score)| ClassificationResult::new(label.clone(), score))
            .collect())
    }

    fn reset(&mut self) {}
}

/// Mean of each class column over `[frames, classes]` row-major scores.
fn average_frames(data: &[f32], classes: usize) -> Option<Vec<f32>> {
    if classes == 0 || data.is_empty() || data.len() % classes != 0 {
        return None;
    }
    let frames = data.len() / classes;
    let mut means = vec![0f32; classes];
    for row in data.chunks_exact(classes) {
        for (acc, v) in means.iter_mut().zip(row) {
            *acc += v;
        }
    }
    for m in &mut means {
        *m /= frames as f32;
    }
    Some(means)
}

/// Parse `index,mid,display_name` rows; the header row is optional.
pub fn parse_class_map(csv: &str) -> Result<Vec<String>> {
    let mut labels = Vec::new();
    for (line_no, line) in csv.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ',');
        let index = fields.next().unwrap_or_default().trim();
        let _mid = fields.next();
        let Some(display) = fields.next() else {
            warn!(line = line_no + 1, "class map row without display name");
            continue;
        };
        if index.parse::<usize>().is_err() {
            // header
            continue;
        }
        labels.push(normalize_label(display.trim().trim_matches('"')));
    }
    if labels.is_empty() {
        return Err(TapwakeError::OnnxSession("class map has no rows".into()));
    }
    Ok(labels)
}

/// `"Water tap, faucet"` → `water_tap_faucet`.
pub fn normalize_label(display: &str) -> String {
    let mut out = String::with_capacity(display.len());
    for ch in display.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_normalise_to_snake_case() {
        assert_eq!(normalize_label("Water tap, faucet"), "water_tap_faucet");
        assert_eq!(normalize_label("Water"), "water");
        assert_eq!(normalize_label("Sink (filling or washing)"), "sink_filling_or_washing");
    }

    #[test]
    fn class_map_skips_header_and_keeps_quoted_commas() {
        let csv = "index,mid,display_name\n\
                   0,/m/09x0r,Speech\n\
                   1,/m/02jz0l,\"Water tap, faucet\"\n";
        let labels = parse_class_map(csv).expect("parse");
        assert_eq!(labels, vec!["speech", "water_tap_faucet"]);
    }

    #[test]
    fn empty_class_map_is_an_error() {
        assert!(parse_class_map("index,mid,display_name\n").is_err());
    }

    #[test]
    fn frame_scores_are_averaged_per_class() {
        let means = average_frames(&[0.0, 1.0, 0.5, 0.5], 2).expect("divisible");
        assert_eq!(means, vec![0.25, 0.75]);
        assert!(average_frames(&[0.1, 0.2, 0.3], 2).is_none());
    }

    #[test]
    fn missing_model_is_reported_by_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OnnxSoundModelConfig::in_dir(dir.path());
        match OnnxSoundModel::new(&config) {
            Err(TapwakeError::ModelNotFound { path }) => assert_eq!(path, config.model_path),
            other => panic!("expected ModelNotFound, got {:?}", other.err()),
        }
    }
}
