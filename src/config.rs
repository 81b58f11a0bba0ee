//! Configuration management for Floodgate.
//!
//! Settings are layered: the YAML file named on the command line first,
//! then `FLOODGATE_`-prefixed environment variables with `__` between
//! nested keys (`FLOODGATE_STORE__BACKEND=redis`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{FailurePolicy, LimiterOptions, DEFAULT_KEY_PREFIX};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Where counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Single-instance, in-process counters
    #[default]
    Memory,
    /// Shared counters in Redis for multi-instance deployments
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for the redis backend
    pub redis_url: Option<String>,

    /// Bound on each store operation before the failure policy applies
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace for every key this service writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the in-process store drops expired entries
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Must be chosen explicitly; there is no safe default for every deployment.
    pub failure_policy: Option<FailurePolicy>,

    /// Path to the rule file
    pub rules_path: Option<PathBuf>,

    /// Rule file reload interval in seconds, 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            failure_policy: None,
            rules_path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file and the environment,
    /// then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        let config: FloodgateConfig = builder
            .add_source(
                Environment::with_prefix("FLOODGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, ignoring the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.failure_policy.is_none() {
            return Err(FloodgateError::Config(
                "limiter.failure_policy must be set to `open` or `closed`".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis
            && self.store.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.store.sweep_interval_ms == 0 {
            return Err(FloodgateError::Config(
                "store.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(FloodgateError::Config("store.key_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.store.sweep_interval_ms)
    }

    /// `None` when reloading is disabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        match self.limiter.reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Limiter options derived from this configuration.
    pub fn limiter_options(&self) -> Result<LimiterOptions> {
        let failure_policy = self.limiter.failure_policy.ok_or_else(|| {
            FloodgateError::Config("limiter.failure_policy is not set".to_string())
        })?;
        Ok(LimiterOptions {
            failure_policy,
            store_timeout: self.store_timeout(),
            key_prefix: self.store.key_prefix.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = FloodgateConfig::from_yaml("limiter:\n  failure_policy: open\n").unwrap();

        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store_timeout(), Duration::from_millis(50));
        assert_eq!(config.store.key_prefix, "floodgate");
        assert_eq!(config.reload_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.limiter_options().unwrap().failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn test_failure_policy_is_required() {
        let result = FloodgateConfig::from_yaml("server:\n  grpc_addr: 0.0.0.0:9000\n");
        assert!(matches!(result, Err(FloodgateError::Config(msg)) if msg.contains("failure_policy")));
    }

    #[test]
    fn test_redis_backend_needs_url() {
        let yaml = "store:\n  backend: redis\nlimiter:\n  failure_policy: closed\n";
        assert!(matches!(FloodgateConfig::from_yaml(yaml), Err(FloodgateError::Config(_))));

        let yaml = "store:\n  backend: redis\n  redis_url: redis://127.0.0.1:6379\nlimiter:\n  failure_policy: closed\n";
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.limiter.failure_policy, Some(FailurePolicy::Closed));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = "store:\n  timeout_ms: 0\nlimiter:\n  failure_policy: open\n";
        assert!(FloodgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = "limiter:\n  failure_policy: sometimes\n";
        assert!(FloodgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_reload_can_be_disabled() {
        let yaml = "limiter:\n  failure_policy: open\n  reload_interval_secs: 0\n";
        assert_eq!(FloodgateConfig::from_yaml(yaml).unwrap().reload_interval(), None);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "server:\n  grpc_addr: 0.0.0.0:9100\nstore:\n  key_prefix: edge\nlimiter:\n  failure_policy: closed\n  rules_path: /etc/floodgate/rules.yaml\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = FloodgateConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.grpc_addr.port(), 9100);
        assert_eq!(config.store.key_prefix, "edge");
        assert_eq!(config.limiter.rules_path, Some(PathBuf::from("/etc/floodgate/rules.yaml")));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.limiter_options().unwrap().key_prefix, "edge");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("floodgate-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert!(FloodgateConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config = FloodgateConfig::from_yaml(include_str!("../config/floodgate.yaml")).unwrap();
        assert_eq!(config.limiter.rules_path, Some(PathBuf::from("config/rules.yaml")));
    }
}
