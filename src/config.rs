//! Process configuration from the environment
//!
//! `.env` is loaded by `run()` before this is read. Scheduler values here are
//! defaults only; settings persisted in the database take precedence.

use crate::sync::{OrchestratorConfig, SchedulerConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_API_URL: &str = "PATROL_SYNC_API_URL";
pub const ENV_DB_PATH: &str = "PATROL_SYNC_DB_PATH";
pub const ENV_API_TOKEN: &str = "PATROL_SYNC_API_TOKEN";
pub const ENV_BACKGROUND_ENABLED: &str = "PATROL_SYNC_BACKGROUND_ENABLED";
pub const ENV_INTERVAL_MINUTES: &str = "PATROL_SYNC_INTERVAL_MINUTES";
pub const ENV_FOREGROUND_IDLE_MINUTES: &str = "PATROL_SYNC_FOREGROUND_IDLE_MINUTES";
pub const ENV_RETENTION_DAYS: &str = "PATROL_SYNC_RETENTION_DAYS";
pub const ENV_RECORD_TIMEOUT_SECS: &str = "PATROL_SYNC_RECORD_TIMEOUT_SECS";
pub const ENV_PROBE_INTERVAL_SECS: &str = "PATROL_SYNC_PROBE_INTERVAL_SECS";

const DB_FILE_NAME: &str = "patrol-sync.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("Failed to get app directories - cannot determine data location")]
    NoDataDir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_url: String,
    /// `None` means the platform data directory
    pub db_path: Option<PathBuf>,
    pub api_token: Option<String>,
    pub background_enabled: bool,
    pub interval_minutes: u64,
    pub foreground_idle_minutes: u64,
    pub retention_days: i64,
    pub record_timeout: Duration,
    pub probe_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_url = get(ENV_API_URL).ok_or(ConfigError::Missing(ENV_API_URL))?;
        let scheduler = SchedulerConfig::default();

        Ok(Self {
            api_url,
            db_path: get(ENV_DB_PATH).map(PathBuf::from),
            api_token: get(ENV_API_TOKEN),
            background_enabled: parse_bool(ENV_BACKGROUND_ENABLED, get(ENV_BACKGROUND_ENABLED), scheduler.enabled)?,
            interval_minutes: parse_or(ENV_INTERVAL_MINUTES, get(ENV_INTERVAL_MINUTES), scheduler.interval_minutes)?,
            foreground_idle_minutes: parse_or(
                ENV_FOREGROUND_IDLE_MINUTES,
                get(ENV_FOREGROUND_IDLE_MINUTES),
                scheduler.foreground_idle_minutes,
            )?,
            retention_days: parse_or(
                ENV_RETENTION_DAYS,
                get(ENV_RETENTION_DAYS),
                crate::sync::store::DEFAULT_RETENTION_DAYS,
            )?,
            record_timeout: Duration::from_secs(parse_or(
                ENV_RECORD_TIMEOUT_SECS,
                get(ENV_RECORD_TIMEOUT_SECS),
                OrchestratorConfig::default().record_timeout.as_secs(),
            )?),
            probe_interval: Duration::from_secs(parse_or(
                ENV_PROBE_INTERVAL_SECS,
                get(ENV_PROBE_INTERVAL_SECS),
                30,
            )?),
        })
    }

    /// Configured path, or `patrol-sync.db` under the platform data dir
    pub fn resolve_db_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }

        let dirs = directories::ProjectDirs::from("com", "patrol", "patrol-sync")
            .ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().join(DB_FILE_NAME))
    }

    /// Scheduler defaults seeded from the environment
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.background_enabled,
            interval_minutes: self.interval_minutes,
            foreground_idle_minutes: self.foreground_idle_minutes,
            last_run: None,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            record_timeout: self.record_timeout,
            ..OrchestratorConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(default);
    };

    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}
