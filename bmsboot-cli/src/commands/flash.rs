//! Write, erase and read command implementations.

use anyhow::{Context, Result};
use bmsboot::{FirmwareImage, PageSize, WorkflowOutcome, session::format_address};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use log::info;
use std::io::IsTerminal;
use std::path::Path;

use super::{open_session, run_workflow};
use crate::config::Config;
use crate::serial::map_prompt_error;
use crate::{Cli, CliError};

/// Options of the write command.
pub(crate) struct WriteOptions<'a> {
    pub firmware: &'a Path,
    pub page_size: Option<PageSize>,
    pub global_erase: bool,
    pub address: Option<&'a str>,
    pub verify: bool,
    pub mark_valid: bool,
}

/// Write command implementation.
pub(crate) fn cmd_write(cli: &Cli, config: &Config, opts: &WriteOptions<'_>) -> Result<()> {
    // Reject unusable images before touching the device
    let image = FirmwareImage::from_file(opts.firmware).with_context(|| {
        format!("Failed to load firmware {}", opts.firmware.display())
    })?;
    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes)",
            style("📦").cyan(),
            opts.firmware.display(),
            image.len()
        );
    }

    let controller = open_session(cli, config)?;
    controller.select_firmware_path(opts.firmware);
    if let Some(size) = opts.page_size {
        controller.set_page_size(&size.to_string())?;
    }
    if opts.global_erase {
        controller.set_global_erase(true);
    }
    if let Some(address) = opts.address {
        controller.set_user_code_address(address)?;
    }
    if opts.verify {
        controller.set_verify(true);
    }
    if !opts.mark_valid {
        controller.set_mark_valid(false);
    }

    let settings = controller.settings();
    info!(
        "Writing to {} with {}-byte pages{}",
        format_address(settings.user_code_address),
        settings.page_size,
        if settings.global_erase {
            ", global erase"
        } else {
            ""
        }
    );

    let handle = controller.start_write()?;
    match run_workflow(&controller, handle)? {
        WorkflowOutcome::Written { bytes } => info!("{bytes} bytes written"),
        other => info!("Unexpected outcome: {other:?}"),
    }
    Ok(())
}

fn confirm_erase(cli: &Cli) -> Result<()> {
    if cli.non_interactive {
        return Err(CliError::Usage(
            "Refusing to erase without --yes in non-interactive mode".to_string(),
        )
        .into());
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage("Erase needs confirmation; pass --yes".to_string()).into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Erase the whole flash?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("Erase cancelled".to_string()).into())
    }
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config, yes: bool) -> Result<()> {
    if !yes {
        confirm_erase(cli)?;
    }

    let controller = open_session(cli, config)?;
    let handle = controller.start_erase()?;
    run_workflow(&controller, handle)?;
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &Config,
    output: &Path,
    length: usize,
    address: Option<&str>,
) -> Result<()> {
    let controller = open_session(cli, config)?;
    if let Some(address) = address {
        controller.set_user_code_address(address)?;
    }
    controller.set_read_length(length);

    let handle = controller.start_read(output)?;
    if let WorkflowOutcome::Read { bytes } = run_workflow(&controller, handle)? {
        if !cli.quiet {
            eprintln!(
                "{} Saved {bytes} bytes to {}",
                style("✓").green(),
                output.display()
            );
        }
    }
    Ok(())
}
