// Node configuration
//
// Defaults, then an optional JSON config file, then environment
// overrides, in that order. Unrecognized keys in the file are an error;
// every recognized option maps onto one of the runtime config structs.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::chain::consensus::ConsensusConfig;
use crate::net::mempool::MempoolConfig;
use crate::net::node::P2pConfig;

/// Standard protocol port.
pub const P2P_PORT: u16 = 7530;

/// Data directory name under the home directory.
pub const DATA_DIR: &str = ".bimetal/mainnet";

pub const ENV_PREFIX: &str = "BIMETAL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid {key}: {value:?}")]
    BadValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filesystem location of the chain store.
    pub chain_data_path: PathBuf,
    /// host:port for inbound peers.
    pub listen_address: String,
    /// Seed peers contacted at start.
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub min_peers: usize,
    /// Mempool bound by transaction count and byte budget.
    pub mempool_capacity_txs: usize,
    pub mempool_capacity_bytes: usize,
    /// Per-block nonce search timeout.
    pub mining_timeout_secs: u64,
    pub mining_workers: usize,
    pub retarget_interval: u64,
    pub target_block_time_secs: u64,
    /// Mempool admission floor, minor units per weight unit.
    pub min_fee_per_weight: u64,
    /// Replay-protection window.
    pub replay_window_secs: i64,
    /// Keep at least this many recent blocks when pruning; 0 disables.
    pub min_retained_blocks: u64,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_data_dir() -> PathBuf {
    home_dir().join(DATA_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chain_data_path: default_data_dir().join("chaindata"),
            listen_address: format!("0.0.0.0:{P2P_PORT}"),
            bootstrap_peers: Vec::new(),
            max_peers: crate::net::node::DEFAULT_MAX_PEERS,
            min_peers: crate::net::node::DEFAULT_MIN_PEERS,
            mempool_capacity_txs: crate::net::mempool::DEFAULT_MAX_COUNT,
            mempool_capacity_bytes: crate::net::mempool::DEFAULT_MAX_BYTES,
            mining_timeout_secs: 300,
            mining_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            retarget_interval: crate::pow::retarget::DEFAULT_RETARGET_INTERVAL,
            target_block_time_secs: crate::pow::retarget::DEFAULT_TARGET_BLOCK_TIME_SECS,
            min_fee_per_weight: 0,
            replay_window_secs: crate::net::mempool::DEFAULT_REPLAY_WINDOW_SECS,
            min_retained_blocks: 0,
        }
    }
}

impl Config {
    /// Defaults ← optional file ← environment.
    pub fn load() -> Result<Config, ConfigError> {
        let path = std::env::var_os(format!("{ENV_PREFIX}CONFIG"))
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join("config.json"));
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Config::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Environment overrides for multi-node testing, teacher-style:
    /// BIMETAL_P2P_PORT, BIMETAL_DATA_DIR, BIMETAL_BOOTSTRAP.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var(format!("{ENV_PREFIX}P2P_PORT")) {
            let port: u16 = port.parse().map_err(|_| ConfigError::BadValue {
                key: "BIMETAL_P2P_PORT",
                value: port.clone(),
            })?;
            self.listen_address = format!("0.0.0.0:{port}");
        }
        if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}DATA_DIR"))
            && !dir.trim().is_empty()
        {
            self.chain_data_path = PathBuf::from(dir).join("chaindata");
        }
        if let Ok(seeds) = std::env::var(format!("{ENV_PREFIX}BOOTSTRAP")) {
            self.bootstrap_peers = seeds
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .collect();
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .parse()
            .map_err(|_| ConfigError::BadValue {
                key: "listen_address",
                value: self.listen_address.clone(),
            })
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.bootstrap_peers
            .iter()
            .map(|s| {
                s.parse().map_err(|_| ConfigError::BadValue {
                    key: "bootstrap_peers",
                    value: s.clone(),
                })
            })
            .collect()
    }

    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            retarget_interval: self.retarget_interval,
            target_block_time_secs: self.target_block_time_secs,
            min_fee_per_weight: self.min_fee_per_weight,
            finality_depth: crate::chain::consensus::DEFAULT_FINALITY_DEPTH,
            orphan_capacity: crate::chain::consensus::DEFAULT_ORPHAN_CAPACITY,
            min_retained: self.min_retained_blocks,
            mempool: MempoolConfig {
                max_count: self.mempool_capacity_txs,
                max_bytes: self.mempool_capacity_bytes,
                replay_window_secs: self.replay_window_secs,
            },
        }
    }

    pub fn p2p(&self) -> Result<P2pConfig, ConfigError> {
        Ok(P2pConfig {
            listen_address: self.listen_addr()?,
            bootstrap_peers: self.bootstrap_addrs()?,
            max_peers: self.max_peers,
            min_peers: self.min_peers,
        })
    }

    pub fn mining_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.mining_timeout_secs)
    }
}
