// packages/engine/src/utils/config.rs
//! Layered engine configuration
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. `kernel-engine.toml` in the working directory (or an explicit file)
//! 3. Environment variables prefixed `KERNEL_ENGINE__`, with `__` separating
//!    sections, e.g. `KERNEL_ENGINE__POOL__SIZE=8`
//!
//! Session options are validated strictly: an unrecognized key fails the
//! load instead of being dropped.

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Name of the startup timeout parameter
pub const STARTUP_READ_TIMEOUT: &str = "STARTUP_READ_TIMEOUT";

/// Name of the graceful termination timeout parameter
pub const TERMINATE_READ_TIMEOUT: &str = "TERMINATE_READ_TIMEOUT";

const DEFAULT_CONFIG_FILE: &str = "kernel-engine";
const ENV_PREFIX: &str = "KERNEL_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kernel: KernelConfig,
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit configuration file, which must then exist
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let builder = match path {
            Some(path) => Config::builder().add_source(File::from(path).required(true)),
            None => Config::builder().add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let config: EngineConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("kernel.args"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.kernel.path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "kernel.path must not be empty".into(),
            ));
        }
        if self.pool.size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "pool.size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// How to launch one kernel process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Kernel executable
    pub path: PathBuf,

    /// Arguments passed on the command line
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("WolframKernel"),
            args: vec![],
            env: HashMap::new(),
        }
    }
}

/// Per-session tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Time allowed for the kernel to emit its ready marker
    #[serde(
        rename = "STARTUP_READ_TIMEOUT",
        alias = "startup_read_timeout",
        deserialize_with = "seconds"
    )]
    pub startup_read_timeout: Duration,

    /// Time allowed for a graceful exit before the kernel is force-killed
    #[serde(
        rename = "TERMINATE_READ_TIMEOUT",
        alias = "terminate_read_timeout",
        deserialize_with = "seconds"
    )]
    pub terminate_read_timeout: Duration,

    /// Level at which kernel stderr lines are forwarded to tracing
    #[serde(deserialize_with = "level")]
    pub kernel_loglevel: Level,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup_read_timeout: Duration::from_secs(20),
            terminate_read_timeout: Duration::from_secs(3),
            kernel_loglevel: Level::WARN,
        }
    }
}

impl SessionConfig {
    /// Build from `(name, seconds)` pairs on top of the defaults
    pub fn from_parameters<'a, I>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut config = Self::default();
        for (name, value) in params {
            config.set_parameter(name, value)?;
        }
        Ok(config)
    }

    /// Override one timeout parameter, given in seconds
    pub fn set_parameter(&mut self, name: &str, seconds: f64) -> Result<()> {
        let value = to_duration(seconds).map_err(|e| {
            EngineError::InvalidConfiguration(format!("{}: {}", name, e))
        })?;

        match name {
            STARTUP_READ_TIMEOUT => self.startup_read_timeout = value,
            TERMINATE_READ_TIMEOUT => self.terminate_read_timeout = value,
            other => {
                return Err(EngineError::InvalidConfiguration(format!(
                    "unknown session parameter '{}' (expected {} or {})",
                    other, STARTUP_READ_TIMEOUT, TERMINATE_READ_TIMEOUT
                )))
            }
        }
        Ok(())
    }

    /// Read back a timeout parameter by name
    pub fn get_parameter(&self, name: &str) -> Option<Duration> {
        match name {
            STARTUP_READ_TIMEOUT => Some(self.startup_read_timeout),
            TERMINATE_READ_TIMEOUT => Some(self.terminate_read_timeout),
            _ => None,
        }
    }

    pub fn with_kernel_loglevel(mut self, level: Level) -> Self {
        self.kernel_loglevel = level;
        self
    }
}

/// Pool sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of kernels started together
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the scrape endpoint; no exporter when unset
    pub listen: Option<SocketAddr>,
}

fn to_duration(seconds: f64) -> std::result::Result<Duration, String> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("timeout must be a positive number of seconds, got {}", seconds));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    to_duration(value).map_err(serde::de::Error::custom)
}

fn level<'de, D>(deserializer: D) -> std::result::Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Level::from_str(&value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.startup_read_timeout, Duration::from_secs(20));
        assert_eq!(config.terminate_read_timeout, Duration::from_secs(3));
        assert_eq!(PoolConfig::default().size, 4);
    }

    #[test]
    fn test_set_parameter() {
        let mut config = SessionConfig::default();
        config.set_parameter(STARTUP_READ_TIMEOUT, 5.0).unwrap();
        config.set_parameter(TERMINATE_READ_TIMEOUT, 0.5).unwrap();

        assert_eq!(config.get_parameter(STARTUP_READ_TIMEOUT), Some(Duration::from_secs(5)));
        assert_eq!(
            config.get_parameter(TERMINATE_READ_TIMEOUT),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_unknown_parameter_fails_fast() {
        let result = SessionConfig::from_parameters([("STARTUP_TIMEOUT", 5.0)]);
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
        assert_eq!(SessionConfig::default().get_parameter("BOGUS"), None);
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let mut config = SessionConfig::default();
        assert!(config.set_parameter(STARTUP_READ_TIMEOUT, 0.0).is_err());
        assert!(config.set_parameter(STARTUP_READ_TIMEOUT, -1.0).is_err());
        assert!(config.set_parameter(STARTUP_READ_TIMEOUT, f64::NAN).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [kernel]
            path = "/opt/kernel/bin/kernel"
            args = ["-noprompt"]

            [session]
            STARTUP_READ_TIMEOUT = 5
            TERMINATE_READ_TIMEOUT = 1.5
            kernel_loglevel = "debug"

            [pool]
            size = 2
            "#,
        );

        let config = EngineConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.kernel.path, PathBuf::from("/opt/kernel/bin/kernel"));
        assert_eq!(config.kernel.args, vec!["-noprompt".to_string()]);
        assert_eq!(config.session.startup_read_timeout, Duration::from_secs(5));
        assert_eq!(config.session.terminate_read_timeout, Duration::from_millis(1500));
        assert_eq!(config.session.kernel_loglevel, Level::DEBUG);
        assert_eq!(config.pool.size, 2);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_unknown_session_key_rejected() {
        let file = write_config(
            r#"
            [session]
            STARTUP_READ_TIMEOUT = 5
            STARTUP_RETRY_SLEEP = 1
            "#,
        );

        assert!(EngineConfig::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let file = write_config("[pool]\nsize = 0\n");
        let result = EngineConfig::load_from(Some(file.path()));
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
    }
}
