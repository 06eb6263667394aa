//! Configuration file support for ergota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ERGOTA_*)
//! 3. File passed with `--config`
//! 4. Local config file (./ergota.toml)
//! 5. Global config file (~/.config/ergota/config.toml)
//!
//! ```toml
//! [ota]
//! transfer_timeout_ms = 6000
//! abort_timeout_ms = 5000
//!
//! [simulator]
//! attr = 509
//! buffer = 8144
//! reply_delay_ms = 10
//! ```

use directories::ProjectDirs;
use ergota::OtaConfig;
use ergota::sim::{DEFAULT_ATTR, DEFAULT_BUFFER, SimConfig};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "ergota.toml";

/// Reply delay used when nothing is configured.
pub const DEFAULT_REPLY_DELAY_MS: u64 = 10;

/// Engine timeouts, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtaSection {
    /// Wait for the Begin, window and End answers.
    pub transfer_timeout_ms: Option<u64>,
    /// Wait for the Abort answer.
    pub abort_timeout_ms: Option<u64>,
}

/// Simulated device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Package size granted by the device.
    pub attr: Option<u32>,
    /// Receive buffer granted by the device.
    pub buffer: Option<u32>,
    /// Delay before each device answer, in milliseconds.
    pub reply_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Engine timeouts.
    #[serde(default)]
    pub ota: OtaSection,
    /// Simulator settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load the global and local files, then the file given with `--config`.
    pub fn load_with(path: Option<&Path>) -> Self {
        let mut config = Self::load();
        if let Some(path) = path {
            config.merge(Self::load_from_path(path));
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

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Invalid TOML in config file {}: {}", path.display(), e))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ergota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.ota.transfer_timeout_ms.is_some() {
            self.ota.transfer_timeout_ms = other.ota.transfer_timeout_ms;
        }
        if other.ota.abort_timeout_ms.is_some() {
            self.ota.abort_timeout_ms = other.ota.abort_timeout_ms;
        }

        if other.simulator.attr.is_some() {
            self.simulator.attr = other.simulator.attr;
        }
        if other.simulator.buffer.is_some() {
            self.simulator.buffer = other.simulator.buffer;
        }
        if other.simulator.reply_delay_ms.is_some() {
            self.simulator.reply_delay_ms = other.simulator.reply_delay_ms;
        }
    }

    /// Engine configuration, defaults filled in.
    pub fn ota_config(&self) -> OtaConfig {
        let mut ota = OtaConfig::default();
        if let Some(ms) = self.ota.transfer_timeout_ms {
            ota = ota.with_transfer_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.ota.abort_timeout_ms {
            ota = ota.with_abort_timeout(Duration::from_millis(ms));
        }
        ota
    }

    /// Package size for planning and simulation.
    pub fn attr(&self) -> u32 {
        self.simulator.attr.unwrap_or(DEFAULT_ATTR)
    }

    /// Receive buffer for planning and simulation.
    pub fn buffer(&self) -> u32 {
        self.simulator.buffer.unwrap_or(DEFAULT_BUFFER)
    }

    /// Simulated device settings, defaults filled in.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            attr: self.attr(),
            buffer: self.buffer(),
            reply_delay: Duration::from_millis(
                self.simulator
                    .reply_delay_ms
                    .unwrap_or(DEFAULT_REPLY_DELAY_MS),
            ),
            ..SimConfig::default()
        }
    }
}
