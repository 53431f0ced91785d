//! Configuration Loader
//!
//! Layers compiled defaults, an optional TOML file and `OUTBOX__*` environment
//! variables with the `config` crate, then validates the result.

use super::error::ConfigResult;
use super::OutboxConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable naming the TOML file to load
pub const CONFIG_PATH_ENV: &str = "OUTBOX_CONFIG_PATH";

/// Prefix of environment overrides (`OUTBOX__RABBITMQ__HOST_NAME`)
pub const ENV_PREFIX: &str = "OUTBOX";

const DEFAULT_CONFIG_FILE: &str = "config/outbox.toml";

/// Holds the loaded configuration and where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<OutboxConfig>,
    environment: String,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from_path(Some(path))
    }

    /// Load configuration from a specific TOML file; a missing file is not an error
    pub fn load_from_path(path: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_source(path, None)
    }

    /// Load with an explicit environment map instead of the process environment.
    /// This is useful for testing without modifying global environment variables.
    pub fn load_with_env_source(
        path: Option<PathBuf>,
        env_source: Option<config::Map<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();

        debug!(
            environment = %environment,
            path = ?path,
            "Loading outbox configuration"
        );

        let config = Self::build(path.as_deref(), env_source)?;
        config.validate()?;

        debug!(
            config = %serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string()),
            "Configuration loaded"
        );
        info!(
            environment = %environment,
            broker = %config.rabbitmq.host_address(),
            version = %config.version,
            pool_size = config.rabbitmq.pool_size,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config: Arc::new(config),
            environment,
            config_path: path,
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: OutboxConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config: Arc::new(config),
            environment: Self::detect_environment(),
            config_path: None,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Shared handle to the loaded configuration
    pub fn shared_config(&self) -> Arc<OutboxConfig> {
        Arc::clone(&self.config)
    }

    /// Sanitized configuration for debugging, with credentials masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was read from, if any was requested
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn build(
        path: Option<&Path>,
        env_source: Option<config::Map<String, String>>,
    ) -> ConfigResult<OutboxConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&OutboxConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env_source),
        );

        let merged = builder.build()?;
        Ok(merged.try_deserialize::<OutboxConfig>()?)
    }

    /// Detect current environment: OUTBOX_ENV || APP_ENV || 'development'
    fn detect_environment() -> String {
        env::var("OUTBOX_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn sanitize_config_for_logging(config: &OutboxConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "token", "credential"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if !is_sensitive {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                        continue;
                    }

                    *val = match val {
                        serde_json::Value::String(s) if s.is_empty() => {
                            serde_json::Value::String("[EMPTY]".to_string())
                        }
                        _ => serde_json::Value::String("[MASKED]".to_string()),
                    };
                }
            }
            serde_json::Value::Array(items) => {
                for item in items.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}
