//! tapwake terminal front end.
//!
//! ```text
//! tapwake run --at 07:30        ring at 07:30, stop when the tap runs
//! tapwake devices               list capture devices
//! tapwake init [--force]        write default settings
//! ```
//!
//! Command-line flags override the settings file for one run only.

mod commands;
mod runner;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use clap::{Args, Parser, Subcommand};
use tapwake_core::audio::device::list_input_devices;
use tapwake_core::InputSource;
use tracing::info;

use commands::parse_hhmm;
use runner::RunOptions;
use settings::{
    default_settings_path, load_settings, normalize_labels, normalize_model, save_settings,
    AppSettings,
};

#[derive(Debug, Parser)]
#[command(name = "tapwake", version, about = "An alarm that stops when it hears running water")]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the alarm loop.
    Run(RunArgs),
    /// List audio input devices.
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Write the default settings file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Trigger time, 24 h local time.
    #[arg(long, value_name = "HH:MM", value_parser = parse_hhmm)]
    at: Option<NaiveTime>,

    /// Minimum confidence for a dismissal, 0..1.
    #[arg(long)]
    threshold: Option<f32>,

    /// Label that dismisses the alarm. Repeatable.
    #[arg(long = "label", value_name = "LABEL")]
    labels: Vec<String>,

    /// Audio file to loop instead of the built-in beep.
    #[arg(long, value_name = "FILE")]
    tone: Option<PathBuf>,

    /// Listen to a WAV file instead of the microphone.
    #[arg(long, value_name = "FILE")]
    input_wav: Option<PathBuf>,

    /// Replay `--input-wav` at its natural pace.
    #[arg(long, requires = "input_wav")]
    realtime: bool,

    /// Capture device name.
    #[arg(long, conflicts_with = "input_wav")]
    device: Option<String>,

    /// Sound classifier: spectral, stub or onnx.
    #[arg(long)]
    model: Option<String>,

    /// Print status and classification events as JSON lines.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply_to(&self, settings: &mut AppSettings) {
        if let Some(threshold) = self.threshold {
            settings.dismissal_threshold = threshold;
        }
        if !self.labels.is_empty() {
            settings.dismissal_labels = normalize_labels(&self.labels);
        }
        if let Some(tone) = &self.tone {
            settings.tone_path = Some(tone.clone());
        }
        if let Some(device) = &self.device {
            settings.preferred_input_device = Some(device.clone());
        }
        if let Some(model) = &self.model {
            settings.model = normalize_model(model);
        }
        settings.normalize();
    }

    fn input_source(&self, settings: &AppSettings) -> InputSource {
        match &self.input_wav {
            Some(path) => InputSource::Wav {
                path: path.clone(),
                realtime: self.realtime,
            },
            None => InputSource::Microphone {
                preferred_device: settings.preferred_input_device.clone(),
            },
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tapwake=info,tapwake_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_devices(json: bool) -> Result<()> {
    let devices = list_input_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("no input devices found");
    }
    for device in devices {
        let mut flags = Vec::new();
        if device.is_default {
            flags.push("default");
        }
        if device.is_monitor {
            flags.push("monitor, will not hear the tap");
        }
        if flags.is_empty() {
            println!("{}", device.name);
        } else {
            println!("{} ({})", device.name, flags.join(", "));
        }
    }
    Ok(())
}

fn init_settings(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }
    save_settings(path, &AppSettings::default())
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    match cli.command {
        CliCommand::Devices { json } => print_devices(json),
        CliCommand::Init { force } => init_settings(&settings_path, force),
        CliCommand::Run(args) => {
            let mut settings = load_settings(&settings_path);
            args.apply_to(&mut settings);
            info!(settings_path = ?settings_path, "settings loaded");

            let options = RunOptions {
                source: args.input_source(&settings),
                trigger: args.at,
                settings,
                json: args.json,
            };
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("starting the tokio runtime")?;
            let result = runtime.block_on(runner::run(options));
            // A pending stdin read would otherwise hold the runtime open.
            runtime.shutdown_background();
            result
        }
    }
}
