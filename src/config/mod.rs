//! Application configuration: one explicit object handed to every component
//! constructor. No process-wide singletons.
//!
//! Lookup order for the file:
//! 1) $FX_REFRESH_CONFIG
//! 2) config/pipeline.toml
//! 3) built-in defaults
//!
//! Then `FX_REFRESH_DATA_DIR`, `FX_REFRESH_INTERVAL_SECS` and `FX_REFRESH_BIND`
//! override the file.

pub mod llm;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub use llm::LlmConfig;

use crate::dispatch::FailurePolicy;
use crate::error::PipelineError;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::retry::RetryPolicy;
use crate::snapshot::DEFAULT_SNAPSHOT_LIMIT;
use crate::sources::{CurrencyPair, PipelineKind};

pub const ENV_CONFIG_PATH: &str = "FX_REFRESH_CONFIG";
pub const ENV_DATA_DIR: &str = "FX_REFRESH_DATA_DIR";
pub const ENV_INTERVAL_SECS: &str = "FX_REFRESH_INTERVAL_SECS";
pub const ENV_BIND: &str = "FX_REFRESH_BIND";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Per sub-pipeline handling of failed work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicies {
    pub news: FailurePolicy,
    pub risk_sentiment: FailurePolicy,
    pub calendar: FailurePolicy,
    pub fundamentals: FailurePolicy,
}

impl Default for FailurePolicies {
    fn default() -> Self {
        Self {
            // synthesis must see that a summary is missing
            news: FailurePolicy::Placeholder,
            risk_sentiment: FailurePolicy::Drop,
            calendar: FailurePolicy::Drop,
            fundamentals: FailurePolicy::Drop,
        }
    }
}

impl FailurePolicies {
    pub fn for_kind(&self, kind: PipelineKind) -> FailurePolicy {
        match kind {
            PipelineKind::News => self.news,
            PipelineKind::RiskSentiment => self.risk_sentiment,
            PipelineKind::Calendar => self.calendar,
            PipelineKind::Fundamentals => self.fundamentals,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root for `results.json`, `history/` and `state/`.
    pub data_dir: PathBuf,
    /// Tick period; production default is 30 minutes.
    pub interval_secs: u64,
    pub snapshot_limit: usize,
    pub history_limit: usize,
    pub flash_limit: usize,
    /// Max units in flight per dispatch; unset = unbounded.
    pub concurrency: Option<usize>,
    pub retry: RetryPolicy,
    /// Pairs the fundamentals pipeline analyses.
    pub pairs: Vec<CurrencyPair>,
    pub failure_policy: FailurePolicies,
    pub api: ApiConfig,
    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let pairs = ["EUR/USD", "GBP/USD", "USD/JPY", "AUD/USD", "USD/CAD", "USD/CHF", "NZD/USD"]
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect();
        Self {
            data_dir: PathBuf::from("data"),
            interval_secs: 30 * 60,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            flash_limit: 50,
            concurrency: None,
            retry: RetryPolicy::default(),
            pairs,
            failure_policy: FailurePolicies::default(),
            api: ApiConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit TOML file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        cfg.finish()
    }

    /// Env path, then `config/pipeline.toml`, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load_from(&default_path);
        }
        Self::default().finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env()?;
        self.llm.resolve()?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var(ENV_INTERVAL_SECS) {
            self.interval_secs = secs
                .trim()
                .parse()
                .map_err(|_| PipelineError::Config(format!("{ENV_INTERVAL_SECS}={secs:?}")))?;
        }
        if let Ok(bind) = std::env::var(ENV_BIND) {
            self.api.bind = bind;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.interval_secs == 0 {
            return Err(PipelineError::Config("interval_secs must be > 0".into()));
        }
        if self.snapshot_limit < 2 {
            // previous() needs two retained snapshots
            return Err(PipelineError::Config("snapshot_limit must be >= 2".into()));
        }
        if self.history_limit == 0 || self.flash_limit == 0 {
            return Err(PipelineError::Config("history limits must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("results.json")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state").join("pipeline_state.json")
    }
}
