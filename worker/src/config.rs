use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_SCRATCH_ROOT: &str = "BIOENGINE_SCRATCH_ROOT";
pub const ENV_MAX_QUEUED_REQUESTS: &str = "BIOENGINE_MAX_QUEUED_REQUESTS";
pub const ENV_NUM_REPLICAS: &str = "BIOENGINE_NUM_REPLICAS";
pub const ENV_DOWNLOAD_TIMEOUT_SECS: &str = "BIOENGINE_DOWNLOAD_TIMEOUT_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Per-instance worker settings.
///
/// `max_ongoing_requests` and `max_queued_requests` are the admission limits
/// handed down by the deployment; `num_replicas` describes the pool this
/// instance belongs to and is not used by the instance itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub scratch_root: PathBuf,
    pub descriptor_file_name: String,
    pub max_ongoing_requests: usize,
    pub max_queued_requests: usize,
    pub num_replicas: usize,
    pub download_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/tmp/bioengine"),
            descriptor_file_name: package::DESCRIPTOR_FILE_NAME.to_string(),
            max_ongoing_requests: 1,
            max_queued_requests: 10,
            num_replicas: 1,
            download_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_descriptor_file_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor_file_name = name.into();
        self
    }

    pub fn with_max_queued_requests(mut self, max_queued_requests: usize) -> Self {
        self.max_queued_requests = max_queued_requests;
        self
    }

    pub fn with_num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config
            .validate()
            .map_err(|message| ConfigError::Invalid { message })?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by `BIOENGINE_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Ok(root) = std::env::var(ENV_SCRATCH_ROOT) {
            config.scratch_root = PathBuf::from(root);
        }
        if let Some(value) = parse_env::<usize>(ENV_MAX_QUEUED_REQUESTS)? {
            config.max_queued_requests = value;
        }
        if let Some(value) = parse_env::<usize>(ENV_NUM_REPLICAS)? {
            config.num_replicas = value;
        }
        if let Some(value) = parse_env::<u64>(ENV_DOWNLOAD_TIMEOUT_SECS)? {
            config.download_timeout_secs = Some(value);
        }

        config
            .validate()
            .map_err(|message| ConfigError::Invalid { message })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scratch_root.as_os_str().is_empty() {
            return Err("Scratch root cannot be empty".to_string());
        }

        if !self.scratch_root.is_absolute() {
            return Err("Scratch root must be an absolute path".to_string());
        }

        if self.descriptor_file_name.is_empty()
            || self.descriptor_file_name.contains(['/', '\\'])
        {
            return Err("Descriptor file name must be a plain file name".to_string());
        }

        // Staging paths are keyed by model id alone, which is only safe while
        // sessions never overlap.
        if self.max_ongoing_requests != 1 {
            return Err("max_ongoing_requests must be 1".to_string());
        }

        if self.max_queued_requests == 0 {
            return Err("max_queued_requests must be greater than 0".to_string());
        }

        if self.num_replicas == 0 {
            return Err("num_replicas must be greater than 0".to_string());
        }

        if self.download_timeout_secs == Some(0) {
            return Err("Download timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn parse_env<T>(var: &str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Env {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}
