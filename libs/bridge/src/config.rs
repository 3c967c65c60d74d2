//! Bridge configuration
//!
//! Context tuning comes from the `ZMQ_IO_THREADS`, `ZMQ_THREAD_SCHED_POLICY`
//! and `ZMQ_THREAD_PRIORITY` environment variables. Everything else lives in
//! [`BridgeConfig`], loadable from TOML with `BRIDGE_*` overrides.

use crate::error::{Error, Result};
use config_crate::{Config, Environment, File, FileFormat};
use native::consts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment overrides, as a variable name to value map
pub type EnvSource = HashMap<String, String>;

/// Native context tuning; `None` leaves the library default in place
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub io_threads: Option<i32>,
    pub thread_sched_policy: Option<i32>,
    pub thread_priority: Option<i32>,
}

impl ContextConfig {
    /// Read `ZMQ_*` tuning from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(None)
    }

    /// Read `ZMQ_*` tuning from `source` instead of the process environment
    pub fn from_source(source: Option<EnvSource>) -> Result<Self> {
        let raw = Config::builder()
            .add_source(Environment::with_prefix("ZMQ").try_parsing(true).source(source))
            .build()?;
        raw.try_deserialize()
            .map_err(|e| Error::config(format!("ZMQ_* environment: {e}")))
    }

    /// Values set here win over those in `self`
    pub fn overlay(self, other: ContextConfig) -> Self {
        Self {
            io_threads: other.io_threads.or(self.io_threads),
            thread_sched_policy: other.thread_sched_policy.or(self.thread_sched_policy),
            thread_priority: other.thread_priority.or(self.thread_priority),
        }
    }

    /// Native context options to apply, in application order
    pub fn options(&self) -> Vec<(i32, i32)> {
        [
            (consts::IO_THREADS, self.io_threads),
            (consts::THREAD_SCHED_POLICY, self.thread_sched_policy),
            (consts::THREAD_PRIORITY, self.thread_priority),
        ]
        .into_iter()
        .filter_map(|(option, value)| value.map(|v| (option, v)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub context: ContextConfig,
    /// Linger applied when a socket is released without an explicit close
    pub release_linger_ms: u64,
    /// Bound on the worker join during non-blocking thread teardown
    pub join_timeout_ms: u64,
    /// Attempts at finding an unused pipe address per spawn
    pub bind_attempts: u32,
    /// Default buffer size for byte-valued socket options
    pub getsockopt_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            release_linger_ms: 500,
            join_timeout_ms: 5000,
            bind_attempts: 16,
            getsockopt_capacity: 4096,
        }
    }
}

impl BridgeConfig {
    /// Defaults plus process environment overrides
    pub fn from_env() -> Result<Self> {
        Self::load_with(None, None)
    }

    /// Load from an optional TOML file, then apply `BRIDGE_*` and `ZMQ_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, None)
    }

    /// Like [`BridgeConfig::load`], reading overrides from `env` instead of the process
    pub fn load_with(path: Option<&Path>, env: Option<EnvSource>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "loading bridge configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("BRIDGE")
                .try_parsing(true)
                .source(env.clone()),
        );
        let raw = builder.build()?;
        let mut config: BridgeConfig = raw.try_deserialize()?;
        config.context = config.context.overlay(ContextConfig::from_source(env)?);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_attempts == 0 {
            return Err(Error::config("bind_attempts must be at least 1"));
        }
        if self.getsockopt_capacity == 0 {
            return Err(Error::config("getsockopt_capacity must be positive"));
        }
        Ok(())
    }

    pub fn release_linger(&self) -> Duration {
        Duration::from_millis(self.release_linger_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<EnvSource> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn absent_variables_keep_native_defaults() {
        let config = ContextConfig::from_source(env(&[])).unwrap();
        assert_eq!(config, ContextConfig::default());
        assert!(config.options().is_empty());
    }

    #[test]
    fn present_variables_become_context_options() {
        let config = ContextConfig::from_source(env(&[
            ("ZMQ_IO_THREADS", "4"),
            ("ZMQ_THREAD_PRIORITY", "10"),
        ]))
        .unwrap();
        assert_eq!(config.io_threads, Some(4));
        assert_eq!(config.thread_sched_policy, None);
        assert_eq!(
            config.options(),
            vec![(consts::IO_THREADS, 4), (consts::THREAD_PRIORITY, 10)]
        );
    }

    #[test]
    fn non_integer_value_is_a_config_error() {
        let err = ContextConfig::from_source(env(&[("ZMQ_IO_THREADS", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn toml_file_with_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "join_timeout_ms = 250\nbind_attempts = 3\n\n[context]\nio_threads = 2\n"
        )
        .unwrap();

        let config = BridgeConfig::load_with(
            Some(file.path()),
            env(&[("BRIDGE_RELEASE_LINGER_MS", "100"), ("ZMQ_IO_THREADS", "8")]),
        )
        .unwrap();

        assert_eq!(config.join_timeout_ms, 250);
        assert_eq!(config.bind_attempts, 3);
        assert_eq!(config.release_linger_ms, 100);
        assert_eq!(config.context.io_threads, Some(8));
        assert_eq!(config.getsockopt_capacity, 4096);
    }

    #[test]
    fn zero_bind_attempts_is_rejected() {
        let err = BridgeConfig::from_toml_str("bind_attempts = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.release_linger(), Duration::from_millis(500));
        assert_eq!(config.join_timeout(), Duration::from_secs(5));
    }
}
