//! Supervisor configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. built-in defaults ([`SupervisorConfig::default`])
//! 2. a YAML file ([`SupervisorConfig::from_file`]), durations in seconds
//! 3. `SUPERVISOR_*` environment variables ([`SupervisorConfig::with_env_overrides`])
//!
//! The command line applies its own flags on top through the `with_*`
//! builders, then calls [`SupervisorConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML document was malformed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Capacity used for the decode gate in high-memory mode when no explicit
/// capacity was configured.
pub const HIGH_MEMORY_GATE_CAPACITY: usize = 2;

/// Configuration for the supervisor and its worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    // Pool
    /// Fixed number of worker slots.
    pub max_workers: usize,
    /// Program and arguments for OS-process workers. `None` runs simulated
    /// workers in-process.
    pub worker_command: Option<Vec<String>>,

    // Detection
    /// Single timeout shared by the progress and silence tests.
    pub inference_step_timeout: Duration,
    pub preload_timeout: Duration,
    pub download_timeout: Duration,
    pub post_process_timeout: Duration,
    /// Period of the detection sweep.
    pub sweep_interval: Duration,

    // Decode gate
    /// Maximum simultaneous holders of the decode gate.
    pub vae_decode_semaphore_max: usize,
    pub high_memory_mode: bool,
    /// Bounded wait for the gate. Must stay below `inference_step_timeout`.
    pub gate_acquire_timeout: Duration,

    // Lifecycle
    /// How long shutdown waits for in-flight jobs before faulting them.
    pub shutdown_timeout: Duration,
    /// Number of faulted jobs kept for status snapshots.
    pub faulted_history_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            worker_command: None,

            inference_step_timeout: Duration::from_secs(600),
            preload_timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(1800),
            post_process_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),

            vae_decode_semaphore_max: 1,
            high_memory_mode: false,
            gate_acquire_timeout: Duration::from_secs(120),

            shutdown_timeout: Duration::from_secs(30),
            faulted_history_limit: 50,
        }
    }
}

impl SupervisorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from defaults and environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file on top of the defaults.
    ///
    /// The result is not validated; callers layer further overrides first.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses a YAML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document is malformed or a duration is
    /// negative.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        file.apply(Self::default())
    }

    /// Serializes the configuration as YAML, durations in seconds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Yaml` if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&ConfigFile::from(self))?)
    }

    /// Applies `SUPERVISOR_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SUPERVISOR_MAX_WORKERS`
    /// - `SUPERVISOR_WORKER_COMMAND`: whitespace-separated program and args
    /// - `SUPERVISOR_INFERENCE_STEP_TIMEOUT_SECS`
    /// - `SUPERVISOR_PRELOAD_TIMEOUT_SECS`
    /// - `SUPERVISOR_DOWNLOAD_TIMEOUT_SECS`
    /// - `SUPERVISOR_POST_PROCESS_TIMEOUT_SECS`
    /// - `SUPERVISOR_SWEEP_INTERVAL_SECS`
    /// - `SUPERVISOR_VAE_DECODE_SEMAPHORE_MAX`
    /// - `SUPERVISOR_HIGH_MEMORY_MODE`
    /// - `SUPERVISOR_GATE_ACQUIRE_TIMEOUT_SECS`
    /// - `SUPERVISOR_SHUTDOWN_TIMEOUT_SECS`
    /// - `SUPERVISOR_FAULTED_HISTORY_LIMIT`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable values.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SUPERVISOR_MAX_WORKERS") {
            self.max_workers = parse_env_value(&val, "SUPERVISOR_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("SUPERVISOR_WORKER_COMMAND") {
            let parts: Vec<String> = val.split_whitespace().map(String::from).collect();
            self.worker_command = if parts.is_empty() { None } else { Some(parts) };
        }

        let durations: [(&str, &mut Duration); 7] = [
            (
                "SUPERVISOR_INFERENCE_STEP_TIMEOUT_SECS",
                &mut self.inference_step_timeout,
            ),
            ("SUPERVISOR_PRELOAD_TIMEOUT_SECS", &mut self.preload_timeout),
            ("SUPERVISOR_DOWNLOAD_TIMEOUT_SECS", &mut self.download_timeout),
            (
                "SUPERVISOR_POST_PROCESS_TIMEOUT_SECS",
                &mut self.post_process_timeout,
            ),
            ("SUPERVISOR_SWEEP_INTERVAL_SECS", &mut self.sweep_interval),
            (
                "SUPERVISOR_GATE_ACQUIRE_TIMEOUT_SECS",
                &mut self.gate_acquire_timeout,
            ),
            ("SUPERVISOR_SHUTDOWN_TIMEOUT_SECS", &mut self.shutdown_timeout),
        ];
        for (key, slot) in durations {
            if let Some(val) = lookup(key) {
                let secs: f64 = parse_env_value(&val, key)?;
                *slot = secs_to_duration(secs, key)?;
            }
        }

        if let Some(val) = lookup("SUPERVISOR_VAE_DECODE_SEMAPHORE_MAX") {
            self.vae_decode_semaphore_max =
                parse_env_value(&val, "SUPERVISOR_VAE_DECODE_SEMAPHORE_MAX")?;
        }

        if let Some(val) = lookup("SUPERVISOR_HIGH_MEMORY_MODE") {
            self.high_memory_mode = parse_env_bool(&val, "SUPERVISOR_HIGH_MEMORY_MODE")?;
        }

        if let Some(val) = lookup("SUPERVISOR_FAULTED_HISTORY_LIMIT") {
            self.faulted_history_limit =
                parse_env_value(&val, "SUPERVISOR_FAULTED_HISTORY_LIMIT")?;
        }

        Ok(self)
    }

    /// Decode gate capacity after applying high-memory mode.
    ///
    /// High-memory mode raises the capacity to
    /// [`HIGH_MEMORY_GATE_CAPACITY`] unless a non-default value was set.
    pub fn effective_gate_capacity(&self) -> usize {
        let default_capacity = Self::default().vae_decode_semaphore_max;
        if self.high_memory_mode && self.vae_decode_semaphore_max == default_capacity {
            HIGH_MEMORY_GATE_CAPACITY
        } else {
            self.vae_decode_semaphore_max
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if let Some(command) = &self.worker_command {
            if command.is_empty() || command[0].is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "worker_command cannot be empty".to_string(),
                ));
            }
        }

        let timeouts = [
            ("inference_step_timeout", self.inference_step_timeout),
            ("preload_timeout", self.preload_timeout),
            ("download_timeout", self.download_timeout),
            ("post_process_timeout", self.post_process_timeout),
            ("sweep_interval", self.sweep_interval),
            ("gate_acquire_timeout", self.gate_acquire_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.vae_decode_semaphore_max == 0 {
            return Err(ConfigError::ValidationFailed(
                "vae_decode_semaphore_max must be greater than 0".to_string(),
            ));
        }

        if self.gate_acquire_timeout >= self.inference_step_timeout {
            return Err(ConfigError::ValidationFailed(
                "gate_acquire_timeout must be less than inference_step_timeout".to_string(),
            ));
        }

        if self.sweep_interval > self.inference_step_timeout {
            return Err(ConfigError::ValidationFailed(
                "sweep_interval cannot exceed inference_step_timeout".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the pool size.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Builder method to run OS-process workers with this command.
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Builder method to set the inference stall timeout.
    pub fn with_inference_step_timeout(mut self, timeout: Duration) -> Self {
        self.inference_step_timeout = timeout;
        self
    }

    pub fn with_preload_timeout(mut self, timeout: Duration) -> Self {
        self.preload_timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_post_process_timeout(mut self, timeout: Duration) -> Self {
        self.post_process_timeout = timeout;
        self
    }

    /// Builder method to set the detection sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builder method to set the decode gate capacity.
    pub fn with_vae_decode_semaphore_max(mut self, max: usize) -> Self {
        self.vae_decode_semaphore_max = max;
        self
    }

    pub fn with_high_memory_mode(mut self, enabled: bool) -> Self {
        self.high_memory_mode = enabled;
        self
    }

    /// Builder method to set the bounded gate wait.
    pub fn with_gate_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.gate_acquire_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_faulted_history_limit(mut self, limit: usize) -> Self {
        self.faulted_history_limit = limit;
        self
    }
}

/// On-disk shape of the configuration. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inference_step_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    preload_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    download_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    post_process_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sweep_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vae_decode_semaphore_max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    high_memory_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gate_acquire_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shutdown_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    faulted_history_limit: Option<usize>,
}

impl ConfigFile {
    fn apply(self, mut config: SupervisorConfig) -> Result<SupervisorConfig, ConfigError> {
        if let Some(v) = self.max_workers {
            config.max_workers = v;
        }
        if let Some(v) = self.worker_command {
            config.worker_command = Some(v);
        }
        if let Some(v) = self.inference_step_timeout {
            config.inference_step_timeout = secs_to_duration(v, "inference_step_timeout")?;
        }
        if let Some(v) = self.preload_timeout {
            config.preload_timeout = secs_to_duration(v, "preload_timeout")?;
        }
        if let Some(v) = self.download_timeout {
            config.download_timeout = secs_to_duration(v, "download_timeout")?;
        }
        if let Some(v) = self.post_process_timeout {
            config.post_process_timeout = secs_to_duration(v, "post_process_timeout")?;
        }
        if let Some(v) = self.sweep_interval {
            config.sweep_interval = secs_to_duration(v, "sweep_interval")?;
        }
        if let Some(v) = self.vae_decode_semaphore_max {
            config.vae_decode_semaphore_max = v;
        }
        if let Some(v) = self.high_memory_mode {
            config.high_memory_mode = v;
        }
        if let Some(v) = self.gate_acquire_timeout {
            config.gate_acquire_timeout = secs_to_duration(v, "gate_acquire_timeout")?;
        }
        if let Some(v) = self.shutdown_timeout {
            config.shutdown_timeout = secs_to_duration(v, "shutdown_timeout")?;
        }
        if let Some(v) = self.faulted_history_limit {
            config.faulted_history_limit = v;
        }
        Ok(config)
    }
}

impl From<&SupervisorConfig> for ConfigFile {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_workers: Some(config.max_workers),
            worker_command: config.worker_command.clone(),
            inference_step_timeout: Some(config.inference_step_timeout.as_secs_f64()),
            preload_timeout: Some(config.preload_timeout.as_secs_f64()),
            download_timeout: Some(config.download_timeout.as_secs_f64()),
            post_process_timeout: Some(config.post_process_timeout.as_secs_f64()),
            sweep_interval: Some(config.sweep_interval.as_secs_f64()),
            vae_decode_semaphore_max: Some(config.vae_decode_semaphore_max),
            high_memory_mode: Some(config.high_memory_mode),
            gate_acquire_timeout: Some(config.gate_acquire_timeout.as_secs_f64()),
            shutdown_timeout: Some(config.shutdown_timeout.as_secs_f64()),
            faulted_history_limit: Some(config.faulted_history_limit),
        }
    }
}

fn secs_to_duration(secs: f64, key: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a valid number of seconds", secs),
    })
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
