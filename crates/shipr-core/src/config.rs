use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ShiprError;

/// Top-level shipr configuration, stored at `~/.shipr/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiprConfig {
    /// Maximum repositories collected at once by `sync all`.
    #[serde(default = "default_concurrency")]
    pub sync_concurrency: usize,

    /// Items requested per remote page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Tenant used when a command does not name one.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    /// API base used for repositories without their own endpoint.
    #[serde(default = "default_github_api_url")]
    pub github_api_url: url::Url,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// Retry and timeout budget for pooled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,
}

impl PoolSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_wait_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
        }
    }
}

/// Where the process runs. Only non-production runs may serve synthetic metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn allows_synthetic_data(&self) -> bool {
        !matches!(self, Environment::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            _ => Err(format!("unknown environment: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_environment")]
    pub environment: Environment,
}

impl MetricsSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            environment: default_environment(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_page_size() -> u32 {
    100
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_github_api_url() -> url::Url {
    url::Url::parse("https://api.github.com").expect("static url")
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_max_rate_limit_wait_secs() -> u64 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_environment() -> Environment {
    Environment::Production
}

impl Default for ShiprConfig {
    fn default() -> Self {
        Self {
            sync_concurrency: default_concurrency(),
            page_size: default_page_size(),
            default_tenant: default_tenant(),
            github_api_url: default_github_api_url(),
            pool: PoolSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl ShiprConfig {
    /// Returns the shipr home directory (`~/.shipr/`).
    pub fn home_dir() -> Result<PathBuf, ShiprError> {
        let base = dirs::home_dir().ok_or_else(|| ShiprError::Config {
            message: "could not determine home directory".into(),
        })?;
        Ok(base.join(".shipr"))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Result<PathBuf, ShiprError> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// Returns the path to the database file.
    pub fn db_path() -> Result<PathBuf, ShiprError> {
        Ok(Self::home_dir()?.join("shipr.db"))
    }

    /// Load config from the default location, or return defaults if not found.
    pub fn load() -> Result<Self, ShiprError> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ShiprError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ShiprConfig =
            toml::from_str(&content).map_err(|e| ShiprError::Serialization(e.to_string()))?;
        config.page_size = config.page_size.clamp(1, 100);
        Ok(config)
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<(), ShiprError> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ShiprError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ShiprError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Initialize the shipr home directory with default config.
    pub fn init() -> Result<PathBuf, ShiprError> {
        let home = Self::home_dir()?;
        std::fs::create_dir_all(&home)?;

        let config_path = Self::config_path()?;
        if !config_path.exists() {
            Self::default().save_to(&config_path)?;
        }

        Ok(home)
    }
}
