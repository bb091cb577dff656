//! Device session controller.
//!
//! The [`Controller`] owns the bootloader engine and runs one workflow at a
//! time on a background worker:
//!
//! ```text
//! Idle → Detecting → {Application, Bootloader, Unknown}
//!      → (Authorizing) → Erasing | Writing | Reading → Idle
//! ```
//!
//! Settings and progress live behind one lock and are only changed through
//! setters that notify the [`Observer`] when a value actually changes.

mod controller;
mod observer;
mod settings;
mod workflow;

pub use controller::{Controller, WorkflowHandle};
pub use observer::{Callbacks, Observer};
pub use settings::{PageSize, Settings, USER_CODE_BASE, format_address, parse_user_code_address};
pub use workflow::{Workflow, WorkflowOutcome};

use std::fmt;

/// Execution state of the device as seen by detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// User firmware is running.
    Application,
    /// The bootloader answered GET and GET_ID.
    Bootloader,
    /// Nothing answered.
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Application => "application",
            Self::Bootloader => "bootloader",
            Self::Unknown => "unknown",
        })
    }
}

/// Step the running workflow is in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    /// No workflow running.
    #[default]
    Idle,
    /// Probing for the application or the bootloader.
    Detecting,
    /// Moving between application and bootloader.
    Switching,
    /// Challenge-response handshake.
    Authorizing,
    /// Erasing flash.
    Erasing,
    /// Programming flash.
    Writing,
    /// Reading flash.
    Reading,
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Current settings.
    pub settings: Settings,
    /// Ports found by the last scan.
    pub ports: Vec<String>,
    /// Progress of the current transfer.
    pub progress_percent: u8,
    /// Whether a workflow is in flight.
    pub busy: bool,
    /// Step of the running workflow.
    pub phase: SessionPhase,
}
