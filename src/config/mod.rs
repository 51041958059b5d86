//! Configuration loading
//!
//! The YAML file is parsed into [`Settings`] and cross-checked by
//! [`validation`] before anything else starts. A failed load or validation
//! is fatal at startup (exit code 2); in daemon mode a SIGHUP-triggered
//! reload that fails keeps the previous configuration.

pub mod settings;
pub mod validation;

pub use settings::{
    BalancingSettings, Delay, LogLevel, PoolRule, PoolRuleType, ProxmoxApiSettings,
    ProxmoxClusterSettings, ReserveSpec, ResourceReserves, Schedule, ScheduleFormat,
    ServiceSettings, Settings,
};
pub use validation::validate;

use std::path::Path;

use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/proxlb/proxlb.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Read, parse, and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_yaml::from_str(&content)?;
    validate(&settings)?;
    Ok(settings)
}
