//! ergota CLI - Command-line tool for ergometer OTA firmware updates.
//!
//! ## Features
//!
//! - Inspect firmware images: size, MD5 digest and transfer plan
//! - Rehearse a full update against the simulated device
//! - Fault injection to exercise every error path
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use ergota::sim::Fault;
use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Process exit codes.
pub(crate) mod exit_code {
    /// Generic failure.
    pub const FAILURE: i32 = 1;
    /// Invalid usage.
    pub const USAGE: i32 = 2;
    /// Configuration error.
    pub const CONFIG: i32 = 3;
    /// The device or the OTA protocol failed.
    pub const OTA: i32 = 4;
    /// Cancelled by the user.
    pub const CANCELLED: i32 = 130;
}

/// Errors that map to a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid usage not caught by the argument parser.
    #[error("{0}")]
    Usage(String),
    /// Configuration could not be applied.
    #[error("{0}")]
    Config(String),
    /// The operation was cancelled.
    #[error("{0}")]
    Cancelled(String),
}

/// ergota - Over-the-air firmware updates for rowing ergometer monitors.
///
/// Environment variables:
///   ERGOTA_ATTR                  - Simulated package size
///   ERGOTA_BUFFER                - Simulated receive buffer
///   ERGOTA_REPLY_DELAY_MS        - Simulated reply delay
///   ERGOTA_TRANSFER_TIMEOUT_MS   - Begin/window/End timeout
///   ERGOTA_ABORT_TIMEOUT_MS      - Abort timeout
#[derive(Parser)]
#[command(name = "ergota")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Device parameters used to plan a transfer.
#[derive(Args, Debug, Clone, Copy, Default)]
struct PlanArgs {
    /// Package size in bytes (largest Package payload).
    #[arg(long, env = "ERGOTA_ATTR", value_parser = clap::value_parser!(u32).range(1..))]
    attr: Option<u32>,

    /// Device receive buffer in bytes.
    #[arg(long, env = "ERGOTA_BUFFER")]
    buffer: Option<u32>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show size, digest and transfer plan of a firmware file.
    Info {
        /// Path to the firmware image.
        firmware: PathBuf,

        #[command(flatten)]
        plan: PlanArgs,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run a complete update against the simulated device.
    Simulate(SimulateArgs),

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Arguments of `ergota simulate`.
#[derive(Args, Debug)]
struct SimulateArgs {
    /// Path to the firmware image.
    firmware: PathBuf,

    #[command(flatten)]
    plan: PlanArgs,

    /// Delay before each device answer, in milliseconds.
    #[arg(long, env = "ERGOTA_REPLY_DELAY_MS")]
    reply_delay_ms: Option<u64>,

    /// Timeout for Begin, window and End answers, in milliseconds.
    #[arg(long, env = "ERGOTA_TRANSFER_TIMEOUT_MS")]
    transfer_timeout_ms: Option<u64>,

    /// Timeout for the Abort answer, in milliseconds.
    #[arg(long, env = "ERGOTA_ABORT_TIMEOUT_MS")]
    abort_timeout_ms: Option<u64>,

    /// Misbehavior to inject into the simulated device.
    #[arg(long, value_enum)]
    fault: Option<FaultArg>,

    /// Window index (or frame count for `disconnect`) the fault applies to.
    #[arg(long, default_value_t = 0, requires = "fault")]
    fault_at: usize,

    /// Abort the update once this many windows were sent.
    #[arg(long, value_name = "N")]
    cancel_after_windows: Option<usize>,
}

/// Injectable device faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FaultArg {
    /// Answer Begin with NotOk.
    RejectBegin,
    /// Answer Begin with a truncated frame.
    MalformedBegin,
    /// Never answer Begin.
    SilentBegin,
    /// Reject a window acknowledgment.
    RejectWindow,
    /// Withhold a window acknowledgment.
    SilentWindow,
    /// Fail digest verification.
    Checksum,
    /// Fail the flash write on End.
    Storage,
    /// Answer Abort with NotOk.
    RejectAbort,
    /// Never answer Abort.
    SilentAbort,
    /// Drop the link after a number of frames.
    Disconnect,
}

impl FaultArg {
    fn into_fault(self, at: usize) -> Fault {
        match self {
            Self::RejectBegin => Fault::RejectBegin,
            Self::MalformedBegin => Fault::MalformedBegin,
            Self::SilentBegin => Fault::SilentBegin,
            Self::RejectWindow => Fault::RejectWindow(at),
            Self::SilentWindow => Fault::SilentWindow(at),
            Self::Checksum => Fault::CorruptChecksum,
            Self::Storage => Fault::StorageError,
            Self::RejectAbort => Fault::RejectAbort,
            Self::SilentAbort => Fault::SilentAbort,
            Self::Disconnect => Fault::Disconnect(at),
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => exit_code::USAGE,
            CliError::Config(_) => exit_code::CONFIG,
            CliError::Cancelled(_) => exit_code::CANCELLED,
        };
    }

    let lib_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ergota::Error>());
    match lib_err {
        Some(ergota::Error::Ota(_) | ergota::Error::SessionBusy(_)) => exit_code::OTA,
        _ => exit_code::FAILURE,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load_with(cli.config_path.as_deref());

    match &cli.command {
        Commands::Info {
            firmware,
            plan,
            json,
        } => {
            commands::info::cmd_info(firmware, &plan.resolve(&config)?, *json)?;
        },
        Commands::Simulate(args) => {
            commands::simulate::cmd_simulate(cli, &config, args)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}

/// Negotiated parameters after applying flags and config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceParams {
    pub attr: u32,
    pub buffer: u32,
}

impl PlanArgs {
    fn resolve(self, config: &Config) -> Result<DeviceParams> {
        let params = DeviceParams {
            attr: self.attr.unwrap_or_else(|| config.attr()),
            buffer: self.buffer.unwrap_or_else(|| config.buffer()),
        };
        if params.attr == 0 {
            return Err(CliError::Config("simulator.attr must be greater than zero".to_string()).into());
        }
        Ok(params)
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "ergota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}
