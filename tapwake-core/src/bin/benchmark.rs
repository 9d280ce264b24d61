//! Offline detection benchmark over a directory of WAV fixtures.
//!
//! Every fixture is cut into capture frames and pushed through the same
//! `SoundClassifier` + `DismissalDetector` pair the worker uses. Files whose
//! path mentions `water`, `tap` or `faucet` are expected to dismiss; all
//! others are expected not to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tapwake_core::{
    audio::wav,
    buffering::frame::{AudioFrame, FRAME_SAMPLES},
    ClassificationOutcome, DismissalConfig, DismissalDetector, FixedLabelModel, ModelHandle,
    SoundClassifier, SpectralWaterModel,
};

#[derive(Debug)]
struct Args {
    fixtures_dir: PathBuf,
    model: String,
    dismissal: DismissalConfig,
    overlap: f32,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaseResult {
    file: String,
    expect_dismissal: bool,
    dismissed: bool,
    correct: bool,
    /// Audio time until the dismissing window ended.
    time_to_dismissal_ms: Option<f64>,
    windows: usize,
    failures: usize,
    top_labels: BTreeMap<String, usize>,
    max_target_confidence: f32,
    p50_inference_ms: f64,
    p95_inference_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    fixtures_dir: String,
    model: String,
    threshold: f32,
    labels: Vec<String>,
    total_files: usize,
    detection_rate: Option<f64>,
    false_dismissal_rate: Option<f64>,
    avg_time_to_dismissal_ms: Option<f64>,
    p50_inference_ms: f64,
    p95_inference_ms: f64,
    cases: Vec<CaseResult>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut fixtures_dir: Option<PathBuf> = None;
    let mut model = "spectral".to_string();
    let mut dismissal = DismissalConfig::default();
    let mut custom_labels: Vec<String> = Vec::new();
    let mut overlap = 0.5f32;
    let mut output: Option<PathBuf> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--fixtures" => fixtures_dir = Some(PathBuf::from(value("--fixtures")?)),
            "--model" => model = value("--model")?.to_ascii_lowercase(),
            "--threshold" => {
                dismissal.threshold = value("--threshold")?
                    .parse::<f32>()
                    .map_err(|_| "invalid value for --threshold".to_string())?
                    .clamp(0.0, 1.0);
            }
            "--label" => custom_labels.push(value("--label")?),
            "--overlap" => {
                overlap = value("--overlap")?
                    .parse::<f32>()
                    .map_err(|_| "invalid value for --overlap".to_string())?;
            }
            "--output" => output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p tapwake-core --bin tapwake-benchmark -- \\
  --fixtures <dir> [--model spectral|stub|onnx] [--threshold <0..1>] \\
  [--label <name>]... [--overlap <0..0.9>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if !custom_labels.is_empty() {
        dismissal.labels = custom_labels;
    }

    Ok(Args {
        fixtures_dir: fixtures_dir.unwrap_or_else(|| PathBuf::from("benchmarks/fixtures")),
        model,
        dismissal,
        overlap,
        output,
    })
}

fn build_model(name: &str) -> Result<ModelHandle, String> {
    match name {
        "spectral" => Ok(ModelHandle::new(SpectralWaterModel::new())),
        "stub" => Ok(ModelHandle::new(
            FixedLabelModel::new("water", 0.9).with_min_rms(0.01),
        )),
        #[cfg(feature = "onnx")]
        "onnx" => tapwake_core::OnnxSoundModel::new(&tapwake_core::OnnxSoundModelConfig::default())
            .map(ModelHandle::new)
            .map_err(|e| e.to_string()),
        #[cfg(not(feature = "onnx"))]
        "onnx" => Err("the onnx model requires building with --features onnx".into()),
        other => Err(format!("unknown model: {other}")),
    }
}

fn collect_wavs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    for entry in entries {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.is_dir() {
            collect_wavs(&path, out)?;
            continue;
        }
        let is_wav = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("wav"));
        if is_wav {
            out.push(path);
        }
    }
    Ok(())
}

fn expects_dismissal(path: &Path) -> bool {
    let lowered = path.to_string_lossy().to_ascii_lowercase();
    ["water", "tap", "faucet"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn run_case(
    path: &Path,
    args: &Args,
    model: &ModelHandle,
    all_latencies: &mut Vec<f64>,
) -> Result<CaseResult, String> {
    let (samples, format) = wav::load_mono(path).map_err(|e| e.to_string())?;
    let mut classifier = SoundClassifier::new(model.clone(), format.sample_rate, args.overlap)
        .map_err(|e| e.to_string())?;
    let mut detector = DismissalDetector::new(args.dismissal.clone());
    detector.reset(1);

    let mut latencies = Vec::new();
    let mut top_labels: BTreeMap<String, usize> = BTreeMap::new();
    let mut failures = 0usize;
    let mut max_target_confidence = 0f32;
    let mut time_to_dismissal_ms = None;

    for (idx, block) in samples.chunks(FRAME_SAMPLES).enumerate() {
        let frame = AudioFrame::new(block.to_vec(), format, (idx * FRAME_SAMPLES) as u64);
        let started = Instant::now();
        let Some(outcome) = classifier.analyze(&frame) else {
            continue;
        };
        latencies.push(started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            ClassificationOutcome::Failure { .. } => failures += 1,
            ClassificationOutcome::Classification(result) => {
                if args
                    .dismissal
                    .labels
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case(&result.label))
                {
                    max_target_confidence = max_target_confidence.max(result.confidence);
                }
                *top_labels.entry(result.label.clone()).or_default() += 1;
                if detector.observe(&result).is_some() && time_to_dismissal_ms.is_none() {
                    let end = frame.timestamp().as_secs_f64() + frame.duration_secs();
                    time_to_dismissal_ms = Some(end * 1000.0);
                }
            }
        }
    }
    classifier.reset();

    let expect_dismissal = expects_dismissal(path);
    let dismissed = time_to_dismissal_ms.is_some();
    all_latencies.extend_from_slice(&latencies);
    Ok(CaseResult {
        file: path
            .strip_prefix(&args.fixtures_dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        expect_dismissal,
        dismissed,
        correct: expect_dismissal == dismissed,
        time_to_dismissal_ms,
        windows: latencies.len(),
        failures,
        top_labels,
        max_target_confidence,
        p50_inference_ms: percentile(&latencies, 0.50),
        p95_inference_ms: percentile(&latencies, 0.95),
    })
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    if !args.fixtures_dir.exists() {
        return Err(format!(
            "fixtures directory not found: {}",
            args.fixtures_dir.display()
        ));
    }

    let mut wav_files = Vec::new();
    collect_wavs(&args.fixtures_dir, &mut wav_files)?;
    wav_files.sort();
    if wav_files.is_empty() {
        return Err(format!(
            "no .wav fixtures found in {}",
            args.fixtures_dir.display()
        ));
    }

    let model = build_model(&args.model)?;
    model.0.lock().warm_up().map_err(|e| e.to_string())?;

    println!(
        "Running tapwake benchmark on {} fixtures (model={}, threshold={})",
        wav_files.len(),
        args.model,
        args.dismissal.threshold
    );

    let mut all_latencies = Vec::new();
    let mut cases = Vec::new();
    for wav in &wav_files {
        let case = run_case(wav, &args, &model, &mut all_latencies)
            .map_err(|e| format!("{}: {e}", wav.display()))?;
        println!(
            "{} expect={} dismissed={} ttd={}",
            case.file,
            case.expect_dismissal,
            case.dismissed,
            case.time_to_dismissal_ms
                .map(|ms| format!("{ms:.0}ms"))
                .unwrap_or_else(|| "-".into())
        );
        cases.push(case);
    }

    let positives: Vec<&CaseResult> = cases.iter().filter(|c| c.expect_dismissal).collect();
    let negatives: Vec<&CaseResult> = cases.iter().filter(|c| !c.expect_dismissal).collect();
    let rate = |rows: &[&CaseResult]| {
        (!rows.is_empty())
            .then(|| rows.iter().filter(|c| c.dismissed).count() as f64 / rows.len() as f64)
    };
    let ttd: Vec<f64> = cases.iter().filter_map(|c| c.time_to_dismissal_ms).collect();

    let summary = Summary {
        fixtures_dir: args.fixtures_dir.display().to_string(),
        model: args.model.clone(),
        threshold: args.dismissal.threshold,
        labels: args.dismissal.labels.clone(),
        total_files: cases.len(),
        detection_rate: rate(&positives),
        false_dismissal_rate: rate(&negatives),
        avg_time_to_dismissal_ms: mean(&ttd),
        p50_inference_ms: percentile(&all_latencies, 0.50),
        p95_inference_ms: percentile(&all_latencies, 0.95),
        cases,
    };

    println!(
        "Done. files={} detection={} false_dismissal={} p95={:.2}ms",
        summary.total_files,
        summary
            .detection_rate
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "-".into()),
        summary
            .false_dismissal_rate
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "-".into()),
        summary.p95_inference_ms
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
