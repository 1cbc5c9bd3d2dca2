use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    CONFIG_FILE_NAME, DEFAULT_PULSE_INTERVAL_MS, DEFAULT_PULSE_STEP, DEFAULT_REPLY_TIMEOUT_MS,
    DEFAULT_REQUESTS_PER_PULSE, ROOT_DIR_NAME,
};
use crate::epoch::Epoch;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("ConfigDoesNotExist: '{0}'")]
    DoesNotExist(String),
    #[error("ParsingFailed: {0}")]
    ParsingFailed(#[from] config::ConfigError),
    #[error("TomlError: {0}")]
    TomlError(#[from] toml::ser::Error),
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    pub node: NodeConfiguration,
    #[serde(default)]
    pub flow: FlowConfiguration,
    #[serde(default)]
    pub pulse: PulseConfiguration,
    #[serde(default)]
    pub workload: WorkloadConfiguration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeConfiguration {
    pub name: String,
    /// Epoch the clock starts with and the write barrier opens first.
    pub first_epoch: Epoch,
}

impl Default for NodeConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            first_epoch: Epoch::FIRST,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowConfiguration {
    /// How long a dispatcher waits for a handler reply.
    pub reply_timeout_ms: u64,
}

impl FlowConfiguration {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for FlowConfiguration {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
        }
    }
}

/// Local pulse source used when the node runs without a consensus collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PulseConfiguration {
    pub interval_ms: u64,
    /// Distance between two consecutive epochs.
    pub step: u32,
}

impl PulseConfiguration {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PulseConfiguration {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_PULSE_INTERVAL_MS,
            step: DEFAULT_PULSE_STEP,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkloadConfiguration {
    /// Synthetic write requests generated after every pulse. Zero disables the generator.
    pub requests_per_pulse: usize,
}

impl Default for WorkloadConfiguration {
    fn default() -> Self {
        Self {
            requests_per_pulse: DEFAULT_REQUESTS_PER_PULSE,
        }
    }
}

impl Configuration {
    pub fn try_load<I: Into<PathBuf>>(path: I) -> Result<Configuration> {
        let path = path.into();
        if !path.exists() {
            return Err(ConfigurationError::DoesNotExist(
                path.to_string_lossy().to_string(),
            ));
        }
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        config.try_deserialize().map_err(|err| err.into())
    }

    pub fn try_load_from_home_dir(node_name: &str) -> Result<Configuration> {
        let file_path = Self::root_dir()?.join(node_name).join(CONFIG_FILE_NAME);
        Self::try_load(file_path)
    }

    pub fn try_write<I: Into<PathBuf>>(&self, path: I) -> Result<()> {
        let config = toml::to_string(&self)?;

        let config = format!(
            "#This file is generated by cli and automatically overwritten every time when cli is run\n{config}",
        );

        let mut file = std::fs::File::create(path.into())?;
        file.write_all(config.as_bytes())?;

        Ok(())
    }

    pub fn try_write_home_dir(&self, node_name: &str) -> Result<PathBuf> {
        let node_dir = Self::root_dir()?.join(node_name);
        std::fs::create_dir_all(&node_dir)?;

        let file_path = node_dir.join(CONFIG_FILE_NAME);
        self.try_write(file_path.clone())?;
        Ok(file_path)
    }

    pub fn root_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(ROOT_DIR_NAME))
            .ok_or_else(|| ConfigurationError::DoesNotExist("home directory".to_string()))
    }
}
