// Evgrab CLI
// Grab evdev input devices exclusively and print every event they produce

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{debug, error};

use evgrab_core::settings::default_settings_content;
use evgrab_core::{
    validate_device_path, CaptureOptions, Decoded, EvdevBackend, EventSink, Orchestrator,
    Settings, Termination,
};

/// Exit status for unusable device paths (EX_USAGE)
const EXIT_USAGE: u8 = 64;

/// Capture evdev input devices and print their events
#[derive(Parser, Debug)]
#[command(name = "evgrab")]
#[command(version)]
#[command(about = "Exclusively grab input devices and print their events", long_about = None)]
struct Args {
    /// Print per-device and per-decode diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Read devices without grabbing them
    #[arg(short, long)]
    no_grab: bool,

    /// TOML settings file (default: ~/.config/evgrab/settings.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print a commented default settings file and exit
    #[arg(long)]
    print_settings: bool,

    /// Device nodes to capture, e.g. /dev/input/event3
    #[arg(value_name = "DEVICE")]
    devices: Vec<PathBuf>,
}

impl Args {
    /// Settings file named on the command line, or the default one
    fn load_settings(&self) -> anyhow::Result<Settings> {
        match &self.config {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("failed to load settings from {}", path.display())),
            None => Settings::load_default().context("failed to load default settings"),
        }
    }

    /// Devices from the command line replace the ones from settings
    fn devices(&self, settings: &Settings) -> Vec<PathBuf> {
        if self.devices.is_empty() {
            settings.devices().to_vec()
        } else {
            self.devices.clone()
        }
    }

    fn capture_options(&self, settings: &Settings) -> CaptureOptions {
        let mut options = settings.capture_options();
        if self.no_grab {
            options.grab = false;
        }
        options
    }
}

/// Prints records to stdout
struct ConsoleSink {
    verbose: bool,
}

impl EventSink for ConsoleSink {
    fn announce(&mut self, path: &Path) {
        if self.verbose {
            println!("Device at path: {}", path.display());
        }
    }

    fn emit(&mut self, _path: &Path, decoded: &Decoded) {
        let mut out = std::io::stdout().lock();
        let result = if self.verbose {
            writeln!(out, "next event -> status {}", decoded.status)
                .and_then(|_| writeln!(out, "event: {}", decoded.record))
        } else {
            writeln!(out, "event: {}", decoded.record)
        };
        if let Err(e) = result.and_then(|_| out.flush()) {
            debug!("stdout write failed: {}", e);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    if args.print_settings {
        print!("{}", default_settings_content());
        return Ok(ExitCode::SUCCESS);
    }

    let settings = args.load_settings()?;
    match settings.source_path() {
        Some(path) => debug!("settings loaded from {}", path.display()),
        None => debug!("no settings file, using defaults"),
    }
    let devices = args.devices(&settings);

    for path in &devices {
        if let Err(e) = validate_device_path(path) {
            eprintln!("{}", e);
            return Ok(ExitCode::from(EXIT_USAGE));
        }
    }

    let mut orchestrator = Orchestrator::new(EvdevBackend, args.capture_options(&settings));
    orchestrator.add_devices(devices)?;

    let mut sink = ConsoleSink {
        verbose: args.verbose,
    };
    match orchestrator.run(&mut sink).context("capture failed")? {
        Termination::NoDevices => Ok(ExitCode::SUCCESS),
        // Reaching Terminated is always reported as a failure
        Termination::Requested => Ok(ExitCode::FAILURE),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
