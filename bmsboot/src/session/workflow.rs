//! Multi-step workflows run by the controller's worker.

use std::path::PathBuf;
use std::thread;

use log::{debug, warn};

use super::controller::Shared;
use super::{DeviceStatus, SessionPhase, Settings, USER_CODE_BASE};
use crate::bootloader::Bootloader;
use crate::error::{Error, Result};
use crate::firmware::FirmwareImage;
use crate::protocol::command::{DeviceCommunicationCommand, DeviceIdentity};

/// Work the controller can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workflow {
    /// Report whether the application or the bootloader is running.
    Detect,
    /// Toggle between application and bootloader.
    Switch,
    /// Program the selected firmware image.
    Write,
    /// Erase the whole flash.
    Erase,
    /// Save flash contents from the user-code address to a file.
    Read {
        /// Destination file.
        output: PathBuf,
    },
}

/// Result of a finished workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Detection result.
    Detected(DeviceStatus),
    /// Mode the device was switched to.
    Switched(DeviceStatus),
    /// Image programmed.
    Written {
        /// Image size.
        bytes: usize,
    },
    /// Flash erased.
    Erased,
    /// Flash saved to a file.
    Read {
        /// Bytes saved.
        bytes: usize,
    },
}

/// One workflow run over the engine, with a settings snapshot taken at
/// submission.
pub(super) struct Session<'a> {
    bl: &'a mut Bootloader,
    shared: &'a Shared,
    settings: Settings,
}

impl<'a> Session<'a> {
    pub(super) fn new(bl: &'a mut Bootloader, shared: &'a Shared, settings: Settings) -> Self {
        Self {
            bl,
            shared,
            settings,
        }
    }

    pub(super) fn run(&mut self, workflow: Workflow) -> Result<WorkflowOutcome> {
        match workflow {
            Workflow::Detect => self.detect().map(WorkflowOutcome::Detected),
            Workflow::Switch => self.switch_code_mode().map(WorkflowOutcome::Switched),
            Workflow::Write => self
                .write_firmware()
                .map(|bytes| WorkflowOutcome::Written { bytes }),
            Workflow::Erase => self.erase_firmware().map(|()| WorkflowOutcome::Erased),
            Workflow::Read { output } => self
                .read_firmware(output)
                .map(|bytes| WorkflowOutcome::Read { bytes }),
        }
    }

    fn log(&self, line: impl AsRef<str>) {
        self.shared.log(line.as_ref());
    }

    /// Classify the device. The port is left open for the next step.
    ///
    /// A port that cannot be opened counts as no device.
    fn detect(&mut self) -> Result<DeviceStatus> {
        self.shared.set_phase(SessionPhase::Detecting);
        let name = self
            .settings
            .port
            .clone()
            .ok_or_else(|| Error::Config("serial port is not selected".into()))?;

        let status = match self.bl.open(&name) {
            Ok(()) => self.classify(),
            Err(e) => {
                debug!("Cannot open {name}: {e}");
                DeviceStatus::Unknown
            },
        };
        self.log(match status {
            DeviceStatus::Application => "Detected device in application mode!",
            DeviceStatus::Bootloader => "Detected device in bootloader mode!",
            DeviceStatus::Unknown => "No device detected!",
        });
        Ok(status)
    }

    fn classify(&mut self) -> DeviceStatus {
        match self
            .bl
            .send_device_communication_command(DeviceCommunicationCommand::EnableProductionMode)
        {
            Ok(()) => {
                if let Err(e) = self.bl.send_device_communication_command(
                    DeviceCommunicationCommand::DisableProductionMode,
                ) {
                    warn!("Failed to leave production mode: {e}");
                }
                return DeviceStatus::Application;
            },
            Err(e) => debug!("Application check failed: {e}"),
        }

        // Drop whatever the bootloader made of the wake frame
        if let Err(e) = self.bl.reopen() {
            debug!("Reopen failed: {e}");
            return DeviceStatus::Unknown;
        }
        match self.bl.initialize() {
            Ok(identity) => {
                debug!(
                    "Bootloader {} PID 0x{:04X}",
                    identity.version, identity.product_id
                );
                DeviceStatus::Bootloader
            },
            Err(e) => {
                debug!("Bootloader check failed: {e}");
                DeviceStatus::Unknown
            },
        }
    }

    fn jump_to_bootloader(&mut self) -> Result<()> {
        self.shared.set_phase(SessionPhase::Switching);
        self.log("Send jump to bootloader command");
        self.bl.reopen()?;
        self.bl
            .send_device_communication_command(DeviceCommunicationCommand::EnableProductionMode)?;
        self.bl
            .send_device_communication_command(DeviceCommunicationCommand::JumpToBootloader)?;
        self.bl.close()?;
        self.log("Jump to bootloader success!");
        thread::sleep(self.bl.config().bootloader_start_delay);
        Ok(())
    }

    /// Needs GO from the capability set of the current session.
    fn jump_to_application(&mut self) -> Result<()> {
        self.shared.set_phase(SessionPhase::Switching);
        self.log("Send jump to application command");
        self.bl.jump(self.settings.user_code_address)?;
        self.log("Jump to application success");
        self.bl.close()?;
        thread::sleep(self.bl.config().app_start_delay);
        Ok(())
    }

    fn switch_code_mode(&mut self) -> Result<DeviceStatus> {
        match self.detect()? {
            DeviceStatus::Application => {
                self.jump_to_bootloader()?;
                Ok(DeviceStatus::Bootloader)
            },
            DeviceStatus::Bootloader => {
                self.jump_to_application()?;
                Ok(DeviceStatus::Application)
            },
            DeviceStatus::Unknown => Err(Error::DeviceNotFound),
        }
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        match self.detect()? {
            DeviceStatus::Bootloader => Ok(()),
            DeviceStatus::Application => self.jump_to_bootloader(),
            DeviceStatus::Unknown => Err(Error::DeviceNotFound),
        }
    }

    fn authorize(&mut self) -> Result<()> {
        self.shared.set_phase(SessionPhase::Authorizing);
        self.log("Send authorize command");
        self.bl.reopen()?;
        self.bl.authorize()?;
        self.log("Authorization passed!");
        Ok(())
    }

    /// Fresh session with capabilities loaded.
    fn connect(&mut self) -> Result<DeviceIdentity> {
        self.bl.reopen()?;
        let identity = self.bl.initialize()?;
        self.log(format!(
            "Connected: Ver: {}, PID: 0x{:04X}",
            identity.version, identity.product_id
        ));
        Ok(identity)
    }

    fn write_firmware(&mut self) -> Result<usize> {
        let path = self
            .settings
            .firmware_path
            .clone()
            .ok_or_else(|| Error::Config("firmware file is not selected".into()))?;
        let image = FirmwareImage::from_file(&path)?;
        let address = self.settings.user_code_address;

        self.enter_bootloader()?;
        self.authorize()?;
        self.connect()?;

        if self.settings.mark_valid {
            self.bl.mark_firmware(false)?;
        }

        self.shared.set_phase(SessionPhase::Erasing);
        self.log("Erasing...");
        if self.settings.global_erase {
            self.bl.global_erase()?;
        } else {
            let cancel = self.shared.cancel_token();
            self.bl.erase_range(
                USER_CODE_BASE,
                address,
                image.len(),
                self.settings.page_size.bytes(),
                &cancel,
            )?;
        }

        self.shared.set_phase(SessionPhase::Writing);
        self.log("Programming...");
        let cancel = self.shared.cancel_token();
        let shared = self.shared;
        self.bl.write_memory(
            address,
            image.data(),
            |p| shared.set_progress(p.percent()),
            &cancel,
        )?;

        if self.settings.verify {
            self.shared.set_phase(SessionPhase::Reading);
            self.log("Verifying...");
            self.bl.verify_memory(address, image.data(), |_| {}, &cancel)?;
            self.log("Verification passed");
        }

        if self.settings.mark_valid {
            self.bl.mark_firmware(true)?;
        }

        self.log(format!("Success: {} bytes written", image.len()));
        Ok(image.len())
    }

    fn erase_firmware(&mut self) -> Result<()> {
        self.enter_bootloader()?;
        self.authorize()?;
        self.connect()?;

        if self.settings.mark_valid {
            self.bl.mark_firmware(false)?;
        }

        self.shared.set_phase(SessionPhase::Erasing);
        self.log("Erasing...");
        self.bl.global_erase()?;
        self.log("Erase complete");
        Ok(())
    }

    fn read_firmware(&mut self, output: PathBuf) -> Result<usize> {
        let address = self.settings.user_code_address;
        let length = self.settings.read_length;
        if length == 0 {
            return Err(Error::Config("read length must not be zero".into()));
        }

        self.enter_bootloader()?;
        self.connect()?;

        self.shared.set_phase(SessionPhase::Reading);
        self.log("Reading...");
        let cancel = self.shared.cancel_token();
        let shared = self.shared;
        let data = self.bl.read_memory(
            address,
            length,
            |p| shared.set_progress(p.percent()),
            &cancel,
        )?;
        std::fs::write(&output, &data)?;

        self.log(format!("{} bytes read", data.len()));
        Ok(data.len())
    }
}
