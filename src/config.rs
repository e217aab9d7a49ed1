//! Configuration loading for comterm.
//!
//! Settings are read from `~/.comterm/config.toml`; a missing file or
//! missing keys fall back to the defaults below. Command line flags are
//! applied on top by `main`.
//!
//! ```toml
//! [serial]
//! port = 3                      # COM1..COM64
//! baud = 9600
//! hardware_flow_control = false
//! open_on_start = true
//!
//! [terminal]
//! crlf = false                  # treat LF as CR+LF
//! initial_rows = 4
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::serial::PortSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub terminal: TerminalConfig,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// COM port number
    pub port: u8,
    pub baud: u32,
    pub hardware_flow_control: bool,
    /// Open the port as soon as the terminal starts
    pub open_on_start: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: 1,
            baud: 9600,
            hardware_flow_control: false,
            open_on_start: false,
        }
    }
}

impl SerialConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings::new(self.port, self.baud, self.hardware_flow_control)
    }
}

/// Terminal behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// LF also returns the cursor to column 0
    pub crlf: bool,
    /// Row slots allocated up front
    pub initial_rows: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            crlf: false,
            initial_rows: 4,
        }
    }
}

impl Config {
    /// Load the user's configuration, falling back to defaults on any error
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.comterm/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }
}

/// `~/.comterm`, also home of the log file
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".comterm"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
