//! Cluster configuration.
//!
//! One immutable `ClusterConfig` is loaded at process startup and shared by
//! every component. Per-job knobs live in the job manifest instead.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A Raft peer: stable numeric id plus its RPC address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    pub addr: String,
}

/// Straggler mitigation knobs. Disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Fraction of the current phase that must be completed before any
    /// duplicate is considered.
    #[serde(default = "default_speculation_phase_threshold")]
    pub phase_completion_threshold: f64,
    /// A task is a straggler when its progress is below this fraction of
    /// the phase median.
    #[serde(default = "default_speculation_progress_ratio")]
    pub progress_ratio: f64,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phase_completion_threshold: default_speculation_phase_threshold(),
            progress_ratio: default_speculation_progress_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's Raft id. Must appear in `peers`.
    pub node_id: u64,
    /// RPC listen address, e.g. `127.0.0.1:7070`.
    pub listen_addr: String,
    /// Every Raft peer including this node.
    pub peers: Vec<PeerConfig>,
    /// Root of the shared object store (filesystem backend).
    pub store_root: PathBuf,

    /// Worker heartbeat interval H, in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// A worker is dead after `heartbeat_timeout_factor * H` without a
    /// heartbeat.
    #[serde(default = "default_heartbeat_timeout_factor")]
    pub heartbeat_timeout_factor: u32,
    /// Assignment deadline for map tasks, in seconds.
    #[serde(default = "default_map_deadline_secs")]
    pub map_deadline_secs: u64,
    /// Assignment deadline for reduce tasks, in seconds.
    #[serde(default = "default_reduce_deadline_secs")]
    pub reduce_deadline_secs: u64,
    /// Reducer checkpoint cadence: every this many processed keys.
    #[serde(default = "default_checkpoint_interval_keys")]
    pub checkpoint_interval_keys: u64,
    /// Reducer checkpoint cadence: at least every this many seconds.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Minimum progress advance before a `TaskProgress` entry is proposed.
    #[serde(default = "default_progress_delta")]
    pub progress_delta: f64,
    /// A task failing this many attempts fails the job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub speculation: SpeculationConfig,

    /// Raft election timeout bounds, in milliseconds.
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
}

fn default_heartbeat_secs() -> u64 {
    2
}

fn default_heartbeat_timeout_factor() -> u32 {
    3
}

fn default_map_deadline_secs() -> u64 {
    120
}

fn default_reduce_deadline_secs() -> u64 {
    300
}

fn default_checkpoint_interval_keys() -> u64 {
    10_000
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_progress_delta() -> f64 {
    0.05
}

fn default_max_attempts() -> u32 {
    4
}

fn default_speculation_phase_threshold() -> f64 {
    0.75
}

fn default_speculation_progress_ratio() -> f64 {
    0.5
}

fn default_election_timeout_min_ms() -> u64 {
    1_500
}

fn default_election_timeout_max_ms() -> u64 {
    3_000
}

impl ClusterConfig {
    /// Load from a YAML file and validate.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.peers.is_empty() {
            return Err(crate::error::EngineError::Config(
                "peer list is empty".into(),
            ));
        }
        if !self.peers.iter().any(|p| p.id == self.node_id) {
            return Err(crate::error::EngineError::Config(format!(
                "node_id {} not present in peer list",
                self.node_id
            )));
        }
        if self.peers.len() % 2 == 0 {
            return Err(crate::error::EngineError::Config(format!(
                "replica group must have an odd number of peers, got {}",
                self.peers.len()
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs * u64::from(self.heartbeat_timeout_factor))
    }

    pub fn deadline_for(&self, phase: crate::model::Phase) -> Duration {
        match phase {
            crate::model::Phase::Map => Duration::from_secs(self.map_deadline_secs),
            crate::model::Phase::Reduce => Duration::from_secs(self.reduce_deadline_secs),
        }
    }

    /// Addresses of all peers, for client round-robin.
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.addr.clone()).collect()
    }

    /// A single-node configuration rooted at `store_root`, used by tests
    /// and single-box runs.
    pub fn single_node(listen_addr: &str, store_root: PathBuf) -> Self {
        Self {
            node_id: 1,
            listen_addr: listen_addr.to_string(),
            peers: vec![PeerConfig {
                id: 1,
                addr: listen_addr.to_string(),
            }],
            store_root,
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_timeout_factor: default_heartbeat_timeout_factor(),
            map_deadline_secs: default_map_deadline_secs(),
            reduce_deadline_secs: default_reduce_deadline_secs(),
            checkpoint_interval_keys: default_checkpoint_interval_keys(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            progress_delta: default_progress_delta(),
            max_attempts: default_max_attempts(),
            speculation: SpeculationConfig::default(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
        }
    }
}
