//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `cellrun.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;

use cellrun_app::ports::Rate;
use cellrun_app::runner::Arguments;
use cellrun_app::timer::TIMER;
use cellrun_domain::configuration::DeviceConfiguration;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Program to run.
    pub program: ProgramConfig,
    /// State monitoring settings.
    pub state: StateConfig,
    /// Devices making up the cell.
    pub cell: CellConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Program source and arguments.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Path of the waypoint program file.
    pub path: Option<PathBuf>,
    /// Named arguments passed to the program.
    pub arguments: Arguments,
}

/// State stream sampling.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Samples per second logged while the program runs.
    pub rate_hz: u32,
}

/// The cell's device list.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    pub devices: Vec<DeviceConfiguration>,
}

impl Config {
    /// Load configuration from `cellrun.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("cellrun.toml")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CELLRUN_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("CELLRUN_PROGRAM") {
            self.program.path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("CELLRUN_STATE_RATE")
            && let Ok(rate) = val.parse()
        {
            self.state.rate_hz = rate;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.state.rate_hz == 0 {
            return Err(ConfigError::Validation(
                "state rate must be non-zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.cell.devices {
            if device.identifier == TIMER {
                return Err(ConfigError::Validation(format!(
                    "device identifier `{TIMER}` is reserved"
                )));
            }
            if !seen.insert(device.identifier.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "device identifier `{}` is used twice",
                    device.identifier
                )));
            }
        }
        Ok(())
    }

    /// Sampling rate for the state monitor.
    #[must_use]
    pub fn state_rate(&self) -> Rate {
        Rate::hertz(self.state.rate_hz)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "cellrund=info,cellrun_app=info,cellrun_adapter_virtual=info".to_string(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { rate_hz: 10 }
    }
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceConfiguration::new("virtual_robot", "robot"),
                DeviceConfiguration::new("virtual_io", "io"),
            ],
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
