use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::workflow::DependentFailurePolicy;
use crate::{dlog_debug, Error, Result};

pub const DEFAULT_MAX_HISTORY: usize = 1000;
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RESCAN_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FEATURE_TEMPLATE: &str = "feature_implementation";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub max_history: Option<usize>,
    pub idle_interval_ms: Option<u64>,
    pub rescan_interval_ms: Option<u64>,
    pub step_timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_policy: DependentFailurePolicy,
    pub feature_template: Option<String>,
}

impl Config {
    pub fn devteam_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".devteam"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::devteam_dir()?.join("devteam.toml"))
    }

    pub fn effective_max_history(&self) -> usize {
        self.max_history.unwrap_or(DEFAULT_MAX_HISTORY)
    }

    pub fn effective_idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.unwrap_or(DEFAULT_IDLE_INTERVAL_MS))
    }

    pub fn effective_rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.unwrap_or(DEFAULT_RESCAN_INTERVAL_MS))
    }

    /// Per agent-call timeout. `None` means calls may run indefinitely.
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    pub fn effective_feature_template(&self) -> &str {
        self.feature_template
            .as_deref()
            .unwrap_or(DEFAULT_FEATURE_TEMPLATE)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        dlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            dlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        dlog_debug!(
            "Config loaded: max_history={:?}, step_timeout_secs={:?}, failure_policy={}",
            config.max_history,
            config.step_timeout_secs,
            config.failure_policy
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        dlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::devteam_dir()?;
        if !dir.exists() {
            dlog_debug!("Creating devteam directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
