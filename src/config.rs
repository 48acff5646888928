use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::panel::retry::RetryPolicy;
use crate::provisioning::DedicatedPortRange;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProvisionerConfig {
    pub database_url: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Hex encoded AES-256 key for panel passwords at rest.
    pub panel_credentials_key: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Tera template, rendered with `scheme`, `host`, `sub_id`, `email`.
    #[serde(default)]
    pub subscription_url_template: Option<String>,

    #[serde(default = "default_dedicated_port_min")]
    pub dedicated_port_min: u16,

    #[serde(default = "default_dedicated_port_max")]
    pub dedicated_port_max: u16,

    #[serde(default)]
    pub auto_migrate: bool,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialProvisionerConfig {
    database_url: Option<String>,
    listen_addr: Option<String>,
    log_dir: Option<String>,
    panel_credentials_key: Option<String>,
    worker_concurrency: Option<usize>,
    request_timeout_secs: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    subscription_url_template: Option<String>,
    dedicated_port_min: Option<u16>,
    dedicated_port_max: Option<u16>,
    auto_migrate: Option<bool>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_dedicated_port_min() -> u16 {
    20_000
}

fn default_dedicated_port_max() -> u16 {
    60_000
}

impl ProvisionerConfig {
    /// Reads `config_path` (if present) and the process environment. Callers
    /// load any `.env` file beforehand.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let file_config = match config_path {
            Some(path) => Self::read_file(Path::new(path))?,
            None => PartialProvisionerConfig::default(),
        };
        let env_config: PartialProvisionerConfig = envy::from_env()?;

        Self::merge(env_config, file_config)
    }

    fn read_file(path: &Path) -> Result<PartialProvisionerConfig, ConfigError> {
        if !path.exists() {
            return Ok(PartialProvisionerConfig::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Environment overrides file.
    fn merge(
        env: PartialProvisionerConfig,
        file: PartialProvisionerConfig,
    ) -> Result<Self, ConfigError> {
        let config = ProvisionerConfig {
            database_url: env
                .database_url
                .or(file.database_url)
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            listen_addr: env
                .listen_addr
                .or(file.listen_addr)
                .unwrap_or_else(default_listen_addr),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            panel_credentials_key: env
                .panel_credentials_key
                .or(file.panel_credentials_key)
                .ok_or(ConfigError::Missing("PANEL_CREDENTIALS_KEY"))?,
            worker_concurrency: env
                .worker_concurrency
                .or(file.worker_concurrency)
                .unwrap_or_else(default_worker_concurrency),
            request_timeout_secs: env
                .request_timeout_secs
                .or(file.request_timeout_secs)
                .unwrap_or_else(default_request_timeout_secs),
            retry_max_attempts: env
                .retry_max_attempts
                .or(file.retry_max_attempts)
                .unwrap_or_else(default_retry_max_attempts),
            retry_base_delay_ms: env
                .retry_base_delay_ms
                .or(file.retry_base_delay_ms)
                .unwrap_or_else(default_retry_base_delay_ms),
            retry_max_delay_ms: env
                .retry_max_delay_ms
                .or(file.retry_max_delay_ms)
                .unwrap_or_else(default_retry_max_delay_ms),
            subscription_url_template: env
                .subscription_url_template
                .or(file.subscription_url_template),
            dedicated_port_min: env
                .dedicated_port_min
                .or(file.dedicated_port_min)
                .unwrap_or_else(default_dedicated_port_min),
            dedicated_port_max: env
                .dedicated_port_max
                .or(file.dedicated_port_max)
                .unwrap_or_else(default_dedicated_port_max),
            auto_migrate: env.auto_migrate.or(file.auto_migrate).unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("worker_concurrency must be at least 1".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid("retry_max_attempts must be at least 1".into()));
        }
        if self.dedicated_port_min >= self.dedicated_port_max {
            return Err(ConfigError::Invalid(format!(
                "dedicated port range {}..{} is empty",
                self.dedicated_port_min, self.dedicated_port_max
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dedicated_ports(&self) -> DedicatedPortRange {
        DedicatedPortRange {
            min: self.dedicated_port_min,
            max: self.dedicated_port_max,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}
