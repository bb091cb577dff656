//! Serial port selection.
//!
//! The port comes from, in order: `--port`/`BMSBOOT_PORT`, the config
//! file, the only enumerated port, or an interactive picker. Non-interactive
//! mode never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    bmsboot::{Connector, PortInfo, describe_port},
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Outcome of the non-interactive part of the selection.
#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    /// A single port was determined.
    Chosen(String),
    /// The user has to pick one of these.
    Prompt(Vec<PortInfo>),
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn resolve(options: &SerialOptions, config: &Config, ports: Vec<PortInfo>) -> Result<Resolution> {
    if let Some(name) = &options.port {
        return Ok(Resolution::Chosen(name.clone()));
    }

    if let Some(name) = &config.port.name {
        debug!("Using port from config: {name}");
        return Ok(Resolution::Chosen(name.clone()));
    }

    match ports.len() {
        0 => Err(usage_err(
            "No serial ports found. Connect the device or pass --port",
        )),
        1 => {
            let name = ports[0].name.clone();
            info!("Auto-selected port: {name}");
            Ok(Resolution::Chosen(name))
        },
        _ if options.non_interactive => Err(usage_err(
            "Multiple serial ports found; pass --port in non-interactive mode",
        )),
        _ => Ok(Resolution::Prompt(ports)),
    }
}

/// Select a serial port automatically or interactively.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &Config,
    connector: &dyn Connector,
) -> Result<String> {
    let ports = if options.port.is_some() || config.port.name.is_some() {
        Vec::new()
    } else {
        connector.list_ports()?
    };

    match resolve(options, config, ports)? {
        Resolution::Chosen(name) => Ok(name),
        Resolution::Prompt(ports) => {
            ensure_interactive_terminal()?;
            select_port_interactive(&ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs a terminal; pass --port or set BMSBOOT_PORT",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

fn select_port_interactive(ports: &[PortInfo]) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&describe_port(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Selection cancelled".to_string()).into()),
    }
}
