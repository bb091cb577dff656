//! bmsboot CLI - program BMS controllers through their serial bootloader.
//!
//! ## Features
//!
//! - Detect whether the application or the bootloader is running
//! - Switch between application and bootloader
//! - Write, erase and read back flash
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use bmsboot::{Generation, PageSize};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod output;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit code for an error.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<bmsboot::Error>() {
        Some(bmsboot::Error::OperationCancelled) => 130,
        _ => 1,
    }
}

/// bmsboot - program BMS controllers through their serial bootloader.
///
/// Environment variables:
///   BMSBOOT_PORT              - Default serial port
///   BMSBOOT_BAUD              - Baud rate (default: 38400)
///   BMSBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "bmsboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    bmsboot -p /dev/ttyUSB0 detect\n  \
    bmsboot write firmware.bin --verify\n  \
    bmsboot read dump.bin --length 0x4000")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BMSBOOT_PORT")]
    pub port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "BMSBOOT_BAUD")]
    pub baud: Option<u32>,

    /// Wire format generation (crc16, xor).
    #[arg(long, global = true, value_parser = parse_generation)]
    pub protocol: Option<Generation>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress console messages).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BMSBOOT_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Open every candidate name instead of trusting the OS list.
        #[arg(long)]
        scan: bool,

        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Report whether the application or the bootloader is running.
    Detect,

    /// Switch between application and bootloader.
    Switch,

    /// Program a raw binary image.
    Write {
        /// Firmware image.
        firmware: PathBuf,

        /// Erase page size in bytes (128, 256, 2048).
        #[arg(long, value_parser = parse_page_size)]
        page_size: Option<PageSize>,

        /// Erase the whole flash instead of the pages the image covers.
        #[arg(long)]
        global_erase: bool,

        /// User-code address (hex).
        #[arg(short, long)]
        address: Option<String>,

        /// Read the image back after programming.
        #[arg(long)]
        verify: bool,

        /// Do not write the firmware validation marker.
        #[arg(long)]
        no_mark: bool,
    },

    /// Erase the whole flash.
    Erase {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Save flash contents to a file.
    Read {
        /// Output file.
        output: PathBuf,

        /// Number of bytes (decimal or 0x-prefixed hex).
        #[arg(short, long, value_parser = parse_size)]
        length: usize,

        /// Start address (hex, defaults to the user-code address).
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

fn parse_generation(s: &str) -> Result<Generation, String> {
    s.parse()
}

fn parse_page_size(s: &str) -> Result<PageSize, String> {
    s.parse().map_err(|e: bmsboot::Error| e.to_string())
}

/// Parse a byte count given as decimal or 0x-prefixed hex.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(0) => Err("length must be greater than zero".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("Invalid length: {e}")),
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
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
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { scan, json } => commands::ports::cmd_list_ports(cli, *scan, *json),
        Commands::Detect => commands::device::cmd_detect(cli, &config),
        Commands::Switch => commands::device::cmd_switch(cli, &config),
        Commands::Write {
            firmware,
            page_size,
            global_erase,
            address,
            verify,
            no_mark,
        } => commands::flash::cmd_write(
            cli,
            &config,
            &commands::flash::WriteOptions {
                firmware,
                page_size: *page_size,
                global_erase: *global_erase,
                address: address.as_deref(),
                verify: *verify,
                mark_valid: !*no_mark,
            },
        ),
        Commands::Erase { yes } => commands::flash::cmd_erase(cli, &config, *yes),
        Commands::Read {
            output,
            length,
            address,
        } => commands::flash::cmd_read(cli, &config, output, *length, address.as_deref()),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    debug!(
        "bmsboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // First Ctrl-C stops the transfer between chunks, the second one exits
    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
    }) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}
