//! Detect and switch command implementations.

use anyhow::Result;
use bmsboot::{DeviceStatus, WorkflowOutcome};

use super::{open_session, run_workflow};
use crate::Cli;
use crate::config::Config;

/// Detect command implementation. Prints the mode to stdout.
pub(crate) fn cmd_detect(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_session(cli, config)?;
    let handle = controller.start_detect()?;
    if let WorkflowOutcome::Detected(status) = run_workflow(&controller, handle)? {
        println!("{status}");
        if status == DeviceStatus::Unknown {
            return Err(bmsboot::Error::DeviceNotFound.into());
        }
    }
    Ok(())
}

/// Switch command implementation. Prints the new mode to stdout.
pub(crate) fn cmd_switch(cli: &Cli, config: &Config) -> Result<()> {
    let controller = open_session(cli, config)?;
    let handle = controller.start_switch()?;
    if let WorkflowOutcome::Switched(status) = run_workflow(&controller, handle)? {
        println!("{status}");
    }
    Ok(())
}
