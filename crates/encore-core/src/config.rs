//! Configuration system for Encore.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ENCORE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/encore/config.toml
//!   3. ~/.config/encore/config.toml

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::ids::ZoneId;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoreConfig {
    pub dataset: DatasetConfig,
    pub topology: TopologyConfig,
    pub worker: WorkerSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Play-count CSV shared by every worker without its own override.
    pub path: PathBuf,
}

/// Zone → worker membership, loaded at startup. No rebalancing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: u32,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// This worker's subset of the data. None = `dataset.path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Max queries executing concurrently per worker. 0 = available parallelism.
    pub execution_lanes: u32,
    /// Max envelopes waiting on a worker's inbound lane.
    pub queue_depth: usize,
    /// Max user profiles held by one worker's cache.
    pub max_users: usize,
    /// Max cached categories per user profile (LRU).
    pub max_categories_per_user: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Number of clients the daemon spawns.
    pub count: u32,
    /// A dispatched query not delivered within this many ms is abandoned.
    pub deadline_ms: u64,
    /// How often pending queries are checked against their deadline.
    pub sweep_interval_ms: u64,
    pub report_dir: PathBuf,
    pub report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl ZoneConfig {
    pub fn zone_id(&self) -> ZoneId {
        ZoneId(self.id)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("dataset.csv"),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        // One worker per zone, zones 1..=5.
        let zones = (1..=5)
            .map(|id| ZoneConfig {
                id,
                workers: vec![WorkerConfig {
                    name: format!("server_{id}"),
                    address: "localhost".to_string(),
                    port: 1100 + id as u16,
                    dataset: None,
                }],
            })
            .collect();
        Self { zones }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            execution_lanes: 0,
            queue_depth: 1024,
            max_users: 10_000,
            max_categories_per_user: 16,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            count: 1,
            deadline_ms: 30_000,
            sweep_interval_ms: 500,
            report_dir: data_dir().join("reports"),
            report_format: ReportFormat::Text,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("encore")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("encore")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EncoreConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EncoreConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ENCORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EncoreConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject topologies and capacities the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut zones = HashSet::new();
        let mut names = HashSet::new();
        let mut endpoints = HashSet::new();
        for zone in &self.topology.zones {
            if !zones.insert(zone.id) {
                return Err(ConfigError::Invalid(format!("zone {} declared twice", zone.id)));
            }
            for worker in &zone.workers {
                if !names.insert(worker.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "worker {:?} declared twice",
                        worker.name
                    )));
                }
                if !endpoints.insert((worker.address.as_str(), worker.port)) {
                    return Err(ConfigError::Invalid(format!(
                        "worker {:?} shares endpoint {}:{}",
                        worker.name, worker.address, worker.port
                    )));
                }
            }
        }
        if self.worker.queue_depth == 0 {
            return Err(ConfigError::Invalid("worker.queue_depth must be > 0".into()));
        }
        if self.worker.max_users == 0 || self.worker.max_categories_per_user == 0 {
            return Err(ConfigError::Invalid("cache capacities must be > 0".into()));
        }
        if self.client.count == 0 {
            return Err(ConfigError::Invalid("client.count must be > 0".into()));
        }
        if self.client.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("client.sweep_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Apply ENCORE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENCORE_DATASET__PATH") {
            self.dataset.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ENCORE_WORKER__EXECUTION_LANES") {
            if let Ok(n) = v.parse() {
                self.worker.execution_lanes = n;
            }
        }
        if let Ok(v) = std::env::var("ENCORE_CLIENT__COUNT") {
            if let Ok(n) = v.parse() {
                self.client.count = n;
            }
        }
        if let Ok(v) = std::env::var("ENCORE_CLIENT__DEADLINE_MS") {
            if let Ok(n) = v.parse() {
                self.client.deadline_ms = n;
            }
        }
        if let Ok(v) = std::env::var("ENCORE_CLIENT__REPORT_DIR") {
            self.client.report_dir = PathBuf::from(v);
        }
    }
}
