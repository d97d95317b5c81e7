use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::channel;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use machineid_rs::{Encryption, HWIDComponent, IdBuilder};

use distmon::clock::{RandomChooser, SystemClock};
use distmon::config::{find_config_file, read_config, Config, CONFIG_FILE_NAME};
use distmon::cycle::{BatchStatus, Cycle, CycleError, CycleReport};
use distmon::guard::PlatformAssociation;
use distmon::probe::SystemTools;
use distmon::upload::{CurlTransport, UploadError};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Config file to use, instead of searching for distmon.toml from the current directory up
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log in detail, and show full diagnostics when an upload is rejected
    #[arg(short, long)]
    debug: bool,

    /// Run one cycle, even if a schedule is configured
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_file_path = match cli.config {
        Some(path) => path,
        None => match find_config_file(CONFIG_FILE_NAME) {
            Ok(path) => path,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let mut config = match read_config(&config_file_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    config.debug |= cli.debug;

    let level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Config file loaded from: \"{}\"", config_file_path.display());

    if config.buffer.installation.is_empty() {
        match get_installation_id() {
            Ok(id) => config.buffer.installation = id,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        }
    }
    info!("Installation = {}", config.buffer.installation);

    match config.period_duration {
        Some(period) if !cli.once => monitor_loop(&config, period),
        _ => {
            if report(&run_cycle(&config)) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run_cycle(config: &Config) -> Result<CycleReport, CycleError> {
    Cycle {
        config,
        association: &PlatformAssociation,
        tools: &SystemTools,
        transport: &CurlTransport,
        clock: &SystemClock,
        chooser: &RandomChooser,
    }
    .run()
}

/// Run cycles one after another until interrupted, stopping early only on an error no later
/// cycle could recover from
fn monitor_loop(config: &Config, period: Duration) -> ExitCode {
    let (tx, rx) = channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        error!("Error setting Ctrl-C handler: {e}");
        return ExitCode::FAILURE;
    }

    loop {
        let result = run_cycle(config);
        if let Err(e) = &result {
            if e.is_permanent() {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        }
        report(&result);

        // A "sleep", interruptible by receiving a message to exit. Normal looping will produce
        // a timeout error, in which case run the next cycle.
        if rx.recv_timeout(period).is_ok() {
            break;
        }
    }

    info!("Exiting");
    ExitCode::SUCCESS
}

/// Log how a cycle went, returning false if it failed
fn report(result: &Result<CycleReport, CycleError>) -> bool {
    match result {
        Ok(CycleReport::OffNetwork { ssid }) => {
            info!("Not on the {ssid} network");
            true
        }
        Ok(CycleReport::Recorded { batch, .. }) => match batch {
            BatchStatus::NotDue | BatchStatus::Degraded | BatchStatus::Uploaded(_) => {
                info!("Done.");
                true
            }
            BatchStatus::Retained { batch, error } => {
                error!("Could not upload '{batch}': {error}");
                if let UploadError::Rejected { body, .. } = error {
                    info!("Response from store was: {body}");
                }
                false
            }
        },
        Err(e) => {
            error!("{e}");
            false
        }
    }
}

fn get_installation_id() -> Result<String, String> {
    let mut builder = IdBuilder::new(Encryption::SHA256);
    builder
        .add_component(HWIDComponent::CPUID)
        .add_component(HWIDComponent::SystemID);
    builder
        .build("distmon")
        .map(|id| id.chars().filter(char::is_ascii_alphanumeric).collect())
        .map_err(|_| "Could not build unique installation id".to_owned())
}
