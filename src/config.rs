//! Console configuration: defaults, optional JSON file, validation.

use crate::engine::stream::DEFAULT_LOG_CAP;
use crate::pipeline::policy::PolicyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid engine url {url:?}: {reason}")]
    EngineUrl { url: String, reason: String },
    #[error("failure_rate must be between 0 and 1, got {0}")]
    FailureRate(f64),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Base URL of the migration engine; without it the console runs pipeline-only.
    pub engine_url: Option<String>,
    pub source_product: String,
    pub target_product: String,
    /// Number of generated records per run when no records file is given.
    pub records: usize,
    pub records_file: Option<PathBuf>,
    pub policy: PolicyKind,
    pub failure_rate: f64,
    /// Pause between a record entering `migrating` and resolving.
    #[serde(with = "humantime_serde")]
    pub migrate_step: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    pub log_cap: usize,
    pub log_file: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            engine_url: None,
            source_product: "auto-legacy".into(),
            target_product: "auto-2025".into(),
            records: 10,
            records_file: None,
            policy: PolicyKind::Fixture,
            failure_rate: 0.1,
            migrate_step: Duration::from_millis(400),
            command_timeout: Duration::from_secs(10),
            log_cap: DEFAULT_LOG_CAP,
            log_file: None,
        }
    }
}

impl ConsoleConfig {
    /// `<config_dir>/policy-migration-console/config.json`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("policy-migration-console").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the explicit path, else the default path when it exists, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = explicit {
            return Self::load(p);
        }
        match Self::default_path() {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.engine_url {
            reqwest::Url::parse(url).map_err(|e| ConfigError::EngineUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::FailureRate(self.failure_rate));
        }
        if self.records == 0 && self.records_file.is_none() {
            return Err(ConfigError::Zero("records"));
        }
        if self.log_cap == 0 {
            return Err(ConfigError::Zero("log_cap"));
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Zero("command_timeout"));
        }
        Ok(())
    }

    /// Where the TUI writes its diagnostics log.
    pub fn resolved_log_file(&self) -> Option<PathBuf> {
        self.log_file.clone().or_else(|| {
            dirs::data_local_dir().map(|d| d.join("policy-migration-console").join("console.log"))
        })
    }
}
