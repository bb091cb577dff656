//! Command implementations.
//!
//! Each subcommand is implemented in its own module. Device commands share
//! the session setup and workflow polling below.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod flash;
pub(crate) mod ports;

use anyhow::Result;
use bmsboot::{
    Connector, Controller, NativeConnector, SerialConfig, Settings, WorkflowHandle,
    WorkflowOutcome,
};
use log::debug;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::output::ConsoleObserver;
use crate::serial::{SerialOptions, select_serial_port};
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// How often a running workflow is checked for completion and Ctrl-C.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings from the config file, before command-line overrides.
fn base_settings(config: &Config) -> Settings {
    let mut settings = Settings::default();
    if let Some(size) = config.flash.page_size() {
        settings.page_size = size;
    }
    settings.global_erase = config.flash.global_erase;
    settings.verify = config.flash.verify;
    if let Some(mark) = config.flash.mark_valid {
        settings.mark_valid = mark;
    }
    settings
}

/// Open a controller on the selected port.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Controller> {
    let connector: Arc<dyn Connector> = Arc::new(NativeConnector);
    let port = select_serial_port(
        &SerialOptions {
            port: cli.port.clone(),
            non_interactive: cli.non_interactive,
        },
        config,
        connector.as_ref(),
    )?;

    let mut serial = SerialConfig::default();
    if let Some(baud) = cli.baud.or(config.port.baud) {
        serial.baud_rate = baud;
    }
    let mut protocol = config.protocol_config();
    if let Some(generation) = cli.protocol {
        protocol.generation = generation;
    }
    debug!(
        "Using {port} at {} baud, {} protocol",
        serial.baud_rate, protocol.generation
    );

    let observer = Arc::new(ConsoleObserver::new(cli.quiet, use_fancy_output()));
    let controller = Controller::with_serial_config(
        base_settings(config),
        serial,
        protocol,
        connector,
        observer,
    )?;
    if let Some(address) = &config.flash.user_code_address {
        controller.set_user_code_address(address)?;
    }
    controller.select_port(&port)?;
    Ok(controller)
}

/// Wait for a workflow, cancelling it on Ctrl-C.
pub(crate) fn run_workflow(controller: &Controller, handle: WorkflowHandle) -> Result<WorkflowOutcome> {
    let mut cancelled = false;
    loop {
        if let Some(result) = handle.try_wait() {
            return match result {
                Err(bmsboot::Error::OperationCancelled) => {
                    Err(CliError::Cancelled("Operation cancelled".to_string()).into())
                },
                other => Ok(other?),
            };
        }
        if !cancelled && was_interrupted() {
            debug!("Interrupted, cancelling workflow");
            controller.cancel();
            cancelled = true;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
