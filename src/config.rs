//! Engine configuration.
//!
//! Loaded from an optional YAML file. Every field has a default so an empty
//! or missing file yields a working setup.
//!
//! ```yaml
//! store_path: .dripline/executions.json
//! workflows_dir: workflows
//! scheduler:
//!   poll_interval_secs: 60
//!   batch_size: 500
//!   repair_every_cycles: 10
//! repair:
//!   orphan_grace_factor: 5
//!   retry_spread_minutes: 10
//! ```

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DRIPLINE_CONFIG";

const CONFIG_FILE: &str = "dripline.yaml";

/// Lazily-resolved path to the config file.
pub static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: explicit environment override
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            debug!("Using config from {}: {}", CONFIG_ENV, path);
            return PathBuf::from(path);
        }
    }

    // Priority 2: next to the executable
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let path = exe_dir.join(CONFIG_FILE);
            if path.exists() {
                return path;
            }
        }
    }

    // Priority 3: current working directory
    PathBuf::from(CONFIG_FILE)
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between dispatch cycles
    pub poll_interval_secs: u64,
    /// Due records taken per cycle
    pub batch_size: usize,
    /// Run orphan reclamation every N cycles; 0 disables it
    pub repair_every_cycles: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 500,
            repair_every_cycles: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RepairSettings {
    pub batch_size: usize,
    /// Orphan grace period as a multiple of the poll interval
    pub orphan_grace_factor: u32,
    pub retry_spread_minutes: i64,
    pub pending_spread_minutes: i64,
    /// Detail rows kept per report
    pub detail_limit: usize,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            orphan_grace_factor: 5,
            retry_spread_minutes: 10,
            pending_spread_minutes: 60,
            detail_limit: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub store_path: PathBuf,
    pub workflows_dir: PathBuf,
    /// Optional YAML contact fixture for conditions and tag actions
    pub contacts_path: Option<PathBuf>,
    pub outbox_path: PathBuf,
    pub scheduler: SchedulerSettings,
    pub repair: RepairSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(".dripline/executions.json"),
            workflows_dir: PathBuf::from("workflows"),
            contacts_path: None,
            outbox_path: PathBuf::from(".dripline/outbox.jsonl"),
            scheduler: SchedulerSettings::default(),
            repair: RepairSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a config file. An empty file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {}", path.display(), e))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| format!("failed to parse config '{}': {}", path.display(), e))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, else the default location if it exists, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        match path {
            Some(path) => Self::load(path),
            None if DEFAULT_CONFIG_PATH.exists() => Self::load(&*DEFAULT_CONFIG_PATH),
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.max(1))
    }

    /// Time a record may stay `running` before it counts as orphaned.
    pub fn orphan_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.scheduler.poll_interval_secs.max(1) as i64
                * i64::from(self.repair.orphan_grace_factor.max(1)),
        )
    }

    pub fn retry_spread(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.repair.retry_spread_minutes.max(0))
    }

    pub fn pending_spread(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.repair.pending_spread_minutes.max(0))
    }
}
