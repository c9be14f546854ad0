use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Connection pool and locking settings of the backing store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Without one the ledger lives in memory.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Longest wait for a row lock before the unit of work fails with a conflict.
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 15,
            min_connections: 0,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
            lock_timeout_ms: 2_000,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for one attempt of a transfer or a whole batch.
    pub transfer_timeout_ms: u64,
    /// Attempts per call, counting the first; only conflicts are retried.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Record rejected single transfers in the transaction log.
    pub audit_rejections: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 10_000,
            max_attempts: 3,
            retry_backoff_ms: 25,
            audit_rejections: false,
        }
    }
}

impl EngineConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl AppConfig {
    /// Loads a YAML file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    LedgerError::ConfigError(format!("reading {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| LedgerError::ConfigError(format!("parsing yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_attempts == 0 {
            return Err(LedgerError::ConfigError(
                "engine.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.transfer_timeout_ms == 0 {
            return Err(LedgerError::ConfigError(
                "engine.transfer_timeout_ms must be positive".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(LedgerError::ConfigError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
