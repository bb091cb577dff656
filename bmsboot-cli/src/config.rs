//! Configuration file support for bmsboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BMSBOOT_*)
//! 3. Local config file (./bmsboot.toml)
//! 4. Global config file (~/.config/bmsboot/config.toml)

use bmsboot::{Generation, PageSize, ProtocolConfig};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local config file name.
const LOCAL_CONFIG: &str = "bmsboot.toml";

/// Serial port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Erase page size in bytes.
    pub page_size: Option<u32>,
    /// Erase the whole flash before writing.
    #[serde(default)]
    pub global_erase: bool,
    /// User-code address (hex text).
    pub user_code_address: Option<String>,
    /// Read back after writing.
    #[serde(default)]
    pub verify: bool,
    /// Write the validation marker (defaults to on).
    pub mark_valid: Option<bool>,
}

impl FlashConfig {
    /// Configured page size, if it is one the bootloader supports.
    pub fn page_size(&self) -> Option<PageSize> {
        let bytes = self.page_size?;
        match bytes.to_string().parse() {
            Ok(size) => Some(size),
            Err(e) => {
                warn!("Ignoring page_size from config: {e}");
                None
            },
        }
    }
}

/// Wire protocol tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Wire format generation.
    pub generation: Option<Generation>,
    /// Attempts per write frame.
    pub write_retries: Option<usize>,
    /// ACK timeout after write data.
    pub write_timeout_ms: Option<u64>,
    /// ACK timeout after erase parameters.
    pub erase_timeout_ms: Option<u64>,
    /// ACK timeout after the authorization response.
    pub authorize_timeout_ms: Option<u64>,
    /// Wait for the bootloader to start after the jump command.
    pub bootloader_start_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Protocol configuration.
    #[serde(default)]
    pub protocol: ProtocolSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bmsboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.name.is_some() {
            self.port.name = other.port.name;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }

        if other.flash.page_size.is_some() {
            self.flash.page_size = other.flash.page_size;
        }
        if other.flash.global_erase {
            self.flash.global_erase = true;
        }
        if other.flash.user_code_address.is_some() {
            self.flash.user_code_address = other.flash.user_code_address;
        }
        if other.flash.verify {
            self.flash.verify = true;
        }
        if other.flash.mark_valid.is_some() {
            self.flash.mark_valid = other.flash.mark_valid;
        }

        let p = other.protocol;
        if p.generation.is_some() {
            self.protocol.generation = p.generation;
        }
        if p.write_retries.is_some() {
            self.protocol.write_retries = p.write_retries;
        }
        if p.write_timeout_ms.is_some() {
            self.protocol.write_timeout_ms = p.write_timeout_ms;
        }
        if p.erase_timeout_ms.is_some() {
            self.protocol.erase_timeout_ms = p.erase_timeout_ms;
        }
        if p.authorize_timeout_ms.is_some() {
            self.protocol.authorize_timeout_ms = p.authorize_timeout_ms;
        }
        if p.bootloader_start_delay_ms.is_some() {
            self.protocol.bootloader_start_delay_ms = p.bootloader_start_delay_ms;
        }
    }

    /// Engine configuration with the configured overrides applied.
    pub fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        let p = &self.protocol;
        if let Some(generation) = p.generation {
            config.generation = generation;
        }
        if let Some(retries) = p.write_retries {
            // At least one attempt
            config.write_retries = retries.max(1);
        }
        if let Some(ms) = p.write_timeout_ms {
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = p.erase_timeout_ms {
            config.erase_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = p.authorize_timeout_ms {
            config.authorize_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = p.bootloader_start_delay_ms {
            config.bootloader_start_delay = Duration::from_millis(ms);
        }
        config
    }
}
