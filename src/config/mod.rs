//! Configuration management for campus-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheLimits;
use crate::error::{ConfigError, Result};
use crate::session::{LifecycleSettings, ShellSettings};
use crate::sync::{RetryPolicy, SyncSettings};

/// One week
const MAX_INACTIVITY_MINUTES: u64 = 7 * 24 * 60;
const MAX_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Inactivity and credential settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minutes without activity before forced logout
    pub max_inactivity_minutes: u64,

    /// Minutes before expiry at which the warning is shown
    pub warn_before_minutes: u64,

    /// Re-evaluation interval in milliseconds
    pub poll_interval_ms: u64,

    /// Refresh tokens expiring within this many seconds
    pub refresh_threshold_secs: u64,

    /// Actor recorded in audit events
    pub actor_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactivity_minutes: 30,
            warn_before_minutes: 5,
            poll_interval_ms: 30_000,
            refresh_threshold_secs: 300,
            actor_id: "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            retention_secs: 1800,
            sweep_interval_secs: 60,
            max_entries: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::Invalid(
            "Could not determine home directory".to_string(),
        ))?;

        Ok(home.join(".campus-sync").join("config.yaml"))
    }

    /// Config path to use: the override if given, else the default
    pub fn resolve_path(path: Option<&str>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Self::default_path(),
        }
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub fn load_at(path: Option<&str>) -> Result<Self> {
        let path = Self::resolve_path(path)?;
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound.into());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents).map_err(ConfigError::from)?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;

        std::fs::write(path, contents)?;

        // Set file permissions to 600 on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Reject settings the lifecycle and loaders cannot run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.max_inactivity_minutes == 0 {
            return Err(invalid("session.max_inactivity_minutes must be positive"));
        }
        if session.max_inactivity_minutes > MAX_INACTIVITY_MINUTES {
            return Err(invalid(
                "session.max_inactivity_minutes must be at most 10080 (one week)",
            ));
        }
        if session.warn_before_minutes >= session.max_inactivity_minutes {
            return Err(invalid(
                "session.warn_before_minutes must be less than session.max_inactivity_minutes",
            ));
        }
        if session.poll_interval_ms == 0 {
            return Err(invalid("session.poll_interval_ms must be positive"));
        }
        let poll_interval = Duration::from_millis(session.poll_interval_ms);
        if poll_interval > minutes(session.max_inactivity_minutes) {
            return Err(invalid(
                "session.poll_interval_ms must not exceed the inactivity timeout",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.cache.ttl_secs == 0 || self.cache.max_entries == 0 {
            return Err(invalid("cache.ttl_secs and cache.max_entries must be positive"));
        }
        if self.cache.sweep_interval_secs == 0
            || self.cache.sweep_interval_secs > MAX_SWEEP_INTERVAL_SECS
        {
            return Err(invalid("cache.sweep_interval_secs must be between 1 and 86400"));
        }
        Ok(())
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_inactivity: minutes(self.session.max_inactivity_minutes),
            warn_before: minutes(self.session.warn_before_minutes),
            poll_interval: Duration::from_millis(self.session.poll_interval_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            cache: CacheLimits {
                default_ttl: Duration::from_secs(self.cache.ttl_secs),
                retention: Duration::from_secs(self.cache.retention_secs),
                max_entries: self.cache.max_entries,
            },
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
            },
        }
    }

    pub fn shell_settings(&self) -> ShellSettings {
        ShellSettings {
            lifecycle: self.lifecycle_settings(),
            sync: self.sync_settings(),
            refresh_threshold: Duration::from_secs(self.session.refresh_threshold_secs),
            actor_id: self.session.actor_id.clone(),
        }
    }
}

fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

fn invalid(message: &str) -> crate::error::Error {
    ConfigError::Invalid(message.to_string()).into()
}
