//! The `tapwake run` loop.
//!
//! Everything that touches the controller happens on this single task: the
//! 1 Hz tick, input-open results and dismissals from the detection worker,
//! stdin commands and Ctrl-C are multiplexed with `tokio::select!`.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use serde::Serialize;
use tapwake_core::audio::permission::MicrophoneAccess;
use tapwake_core::{
    AlarmController, AlarmStatusEvent, AlarmTone, ClassificationEvent,
    DetectionSession, DetectionStatus, FixedLabelModel, InputSource, MicrophonePermission,
    ModelHandle, SchedulerPhase, SpectralWaterModel,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::commands::{parse_command, Command, HELP};
use crate::settings::{AppSettings, MODEL_ONNX, MODEL_STUB};

const BANNER_FRAMES: [&str; 4] = [
    "  (  RING  )   turn on the tap to dismiss",
    " ((  RING  ))  turn on the tap to dismiss",
    "((( RING )))   turn on the tap to dismiss",
    " ((  RING  ))  turn on the tap to dismiss",
];

pub struct RunOptions {
    pub settings: AppSettings,
    pub trigger: Option<NaiveTime>,
    pub source: InputSource,
    pub json: bool,
}

/// One line of `--json` output.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum OutputLine<'a> {
    Status(&'a AlarmStatusEvent),
    Classification(&'a ClassificationEvent),
}

fn emit_json(line: &OutputLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("failed to serialize output line: {e}"),
    }
}

pub fn build_model(settings: &AppSettings) -> Result<ModelHandle> {
    match settings.model.as_str() {
        MODEL_STUB => Ok(ModelHandle::new(
            FixedLabelModel::new("water", 0.9).with_min_rms(0.02),
        )),
        MODEL_ONNX => onnx_model(settings),
        _ => Ok(ModelHandle::new(SpectralWaterModel::new())),
    }
}

#[cfg(feature = "onnx")]
fn onnx_model(settings: &AppSettings) -> Result<ModelHandle> {
    use tapwake_core::{OnnxSoundModel, OnnxSoundModelConfig};

    let config = match &settings.model_dir {
        Some(dir) => OnnxSoundModelConfig::in_dir(dir),
        None => OnnxSoundModelConfig::default(),
    };
    if !config.model_path.exists() || !config.class_map_path.exists() {
        warn!(
            "ONNX model files not found at {:?}, using the spectral detector",
            config.model_path.parent()
        );
        return Ok(ModelHandle::new(SpectralWaterModel::new()));
    }
    info!("loading OnnxSoundModel from {:?}", config.model_path.parent());
    let model = OnnxSoundModel::new(&config).context("loading the ONNX sound model")?;
    Ok(ModelHandle::new(model))
}

#[cfg(not(feature = "onnx"))]
fn onnx_model(_settings: &AppSettings) -> Result<ModelHandle> {
    warn!("built without the `onnx` feature, using the spectral detector");
    Ok(ModelHandle::new(SpectralWaterModel::new()))
}

/// Human-readable status line.
pub fn describe_status(status: &AlarmStatusEvent) -> String {
    let trigger = status.trigger_time.as_deref().unwrap_or("--:--");
    let phase = match status.phase {
        SchedulerPhase::Idle => "idle",
        SchedulerPhase::Armed => "armed",
        SchedulerPhase::Matching => "due",
        SchedulerPhase::Fired => "ringing",
    };
    let detection = match &status.detection {
        DetectionStatus::Inactive => "not listening".to_string(),
        DetectionStatus::Starting => "opening the microphone".to_string(),
        DetectionStatus::Listening => "listening for water".to_string(),
        DetectionStatus::Unavailable { reason } => {
            format!("cannot listen ({reason}), use `off` to silence")
        }
    };
    let mut line = format!("alarm {trigger} [{phase}] {detection}");
    if let Some(detail) = &status.detail {
        line.push_str(&format!(" ({detail})"));
    }
    line
}

struct Runner {
    alarm: AlarmController<AlarmTone, DetectionSession>,
    json: bool,
    pulse: usize,
}

impl Runner {
    fn print_status(&self, status: &AlarmStatusEvent) {
        if self.json {
            emit_json(&OutputLine::Status(status));
        } else {
            println!("{}", describe_status(status));
        }
    }

    fn tick(&mut self) {
        self.alarm.on_tick(Local::now().time());
        if self.alarm.is_firing() && !self.json {
            println!("{}", BANNER_FRAMES[self.pulse % BANNER_FRAMES.len()]);
            self.pulse = self.pulse.wrapping_add(1);
        } else {
            self.pulse = 0;
        }
    }

    /// Returns `false` when the loop should end.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Enable | Command::Disable => {
                let enabled = command == Command::Enable;
                if self.alarm.config().is_none() {
                    println!("no alarm set, use `set HH:MM`");
                    return true;
                }
                self.alarm.set_enabled(enabled);
            }
            Command::Set(time) => {
                let enabled = self.alarm.config().map_or(true, |c| c.enabled);
                self.alarm.set_alarm(time, enabled);
            }
            Command::Status => {
                let status = self.alarm.status();
                self.print_status(&status);
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }
}

pub async fn run(options: RunOptions) -> Result<()> {
    let RunOptions {
        settings,
        trigger,
        source,
        json,
    } = options;

    let tone = AlarmTone::new(&settings.tone_source()).context("loading the alarm tone")?;
    let permission = match source {
        InputSource::Microphone { .. } => MicrophonePermission::request(),
        InputSource::Wav { .. } => MicrophonePermission::granted(),
    };
    if permission.access() == MicrophoneAccess::Denied {
        warn!("microphone access denied, a ringing alarm can only be silenced with `off`");
    }

    let model = build_model(&settings)?;
    let (dismissal_tx, mut dismissal_rx) = mpsc::unbounded_channel();
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    let mut session = DetectionSession::new(
        settings.detection_config(source),
        settings.dismissal_config(),
        model,
        permission,
        dismissal_tx,
        opened_tx,
    );
    session.warm_up().context("warming up the sound model")?;
    let mut classifications = session.subscribe_classifications();

    let mut alarm = AlarmController::new(tone, session);
    let mut statuses = alarm.subscribe_status();
    match trigger {
        Some(time) => alarm.set_alarm(time, true),
        None => println!("no alarm set, use `set HH:MM`"),
    }
    info!(
        labels = ?settings.dismissal_labels,
        threshold = settings.dismissal_threshold,
        model = %settings.model,
        "tapwake running"
    );
    if !json {
        println!("{HELP}");
    }

    let mut runner = Runner {
        alarm,
        json,
        pulse: 0,
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => runner.tick(),
            Some(event) = opened_rx.recv() => {
                runner.alarm.handle_detection_opened(event);
            }
            Some(event) = dismissal_rx.recv() => {
                if runner.alarm.handle_dismissal(event) && !runner.json {
                    println!("water heard, alarm dismissed");
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(Some(command)) => {
                        if !runner.apply(command) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                },
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    stdin_open = false;
                }
            },
            status = statuses.recv() => match status {
                Ok(status) => runner.print_status(&status),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "status events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = classifications.recv() => match event {
                Ok(event) if runner.json => emit_json(&OutputLine::Classification(&event)),
                Ok(event) => debug!(
                    label = %event.label,
                    confidence = event.confidence,
                    matched = event.matched,
                    "window classified"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "classification events lagged"),
                Err(broadcast::error::RecvError::Closed) => {}
            },
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("ctrl-c handler failed: {e}");
                }
                info!("interrupted");
                break;
            }
        }
    }

    runner.alarm.stop();
    let diag = runner.alarm.detection().diagnostics_snapshot();
    info!(
        frames_in = diag.frames_in,
        windows_analyzed = diag.windows_analyzed,
        dismissals_emitted = diag.dismissals_emitted,
        "tapwake exiting"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapwake_core::SoundModel;

    fn status(detection: DetectionStatus, detail: Option<&str>) -> AlarmStatusEvent {
        AlarmStatusEvent {
            seq: 3,
            phase: SchedulerPhase::Fired,
            firing: true,
            detection,
            trigger_time: Some("07:30".into()),
            detail: detail.map(str::to_string),
        }
    }

    #[test]
    fn status_line_mentions_trigger_and_listener() {
        let line = describe_status(&status(DetectionStatus::Listening, None));
        assert_eq!(line, "alarm 07:30 [ringing] listening for water");
    }

    #[test]
    fn unavailable_status_points_at_off_command() {
        let line = describe_status(&status(
            DetectionStatus::Unavailable {
                reason: "microphone permission denied".into(),
            },
            Some("no output device"),
        ));
        assert!(line.contains("microphone permission denied"));
        assert!(line.contains("`off`"));
        assert!(!line.contains("`stop`"));
        assert!(line.ends_with("(no output device)"));
    }

    #[test]
    fn starting_status_is_described() {
        let line = describe_status(&status(DetectionStatus::Starting, None));
        assert_eq!(line, "alarm 07:30 [ringing] opening the microphone");
    }

    #[test]
    fn json_lines_are_tagged() {
        let event = status(DetectionStatus::Inactive, None);
        let value = serde_json::to_value(OutputLine::Status(&event)).expect("serialize");
        assert_eq!(value["type"], "status");
        assert_eq!(value["triggerTime"], "07:30");
        assert_eq!(value["detection"]["state"], "inactive");
    }

    #[test]
    fn stub_and_spectral_models_build_without_files() {
        let mut settings = AppSettings::default();
        assert!(build_model(&settings).is_ok());
        settings.model = MODEL_STUB.into();
        let model = build_model(&settings).expect("stub model");
        assert_eq!(model.0.lock().sample_rate(), 16_000);
    }
}
