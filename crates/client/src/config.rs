use std::path::PathBuf;

use chaintip_consensus::params::Network;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Path segment bumped on incompatible store layout changes.
pub const STORAGE_VERSION: &str = "1";

pub const DEFAULT_TARGET_CONNECTIONS: usize = 8;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_GETADDR_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_RECENT_DISCONNECT_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_LIVENESS_POLL_SECS: u64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chain label; selects magic, user agent and the built-in invalid list.
    pub chain: String,
    /// Root directory for the persistent stores; in-memory when absent.
    pub database_path: Option<PathBuf>,
    /// Extra invalid block hashes (display hex), unioned with the built-ins.
    pub invalid_blocks: Vec<String>,
    /// Extra bootstrap addresses, `host` or `host:port`.
    pub seed_nodes: Vec<String>,
    pub target_connections: usize,
    /// Connection worker tasks; 0 means twice the target.
    pub num_workers: usize,
    pub recent_disconnect_window_ms: u64,
    pub request_timeout_ms: u64,
    pub getaddr_timeout_ms: u64,
    /// Liveness probe cadence; the ping keepalive runs at the same interval.
    pub liveness_poll_secs: u64,
    /// Overrides the chain's bootstrap peer-list endpoint.
    pub bootstrap_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: "main".to_string(),
            database_path: None,
            invalid_blocks: Vec::new(),
            seed_nodes: Vec::new(),
            target_connections: DEFAULT_TARGET_CONNECTIONS,
            num_workers: 0,
            recent_disconnect_window_ms: DEFAULT_RECENT_DISCONNECT_WINDOW_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            getaddr_timeout_ms: DEFAULT_GETADDR_TIMEOUT_MS,
            liveness_poll_secs: DEFAULT_LIVENESS_POLL_SECS,
            bootstrap_url: None,
        }
    }
}

impl Config {
    pub fn network(&self) -> Result<Network, ClientError> {
        Network::from_str_opt(&self.chain)
            .ok_or_else(|| ClientError::Config(format!("unknown chain: {}", self.chain)))
    }

    pub fn workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            self.target_connections * 2
        }
    }

    /// `<root>/<version>/<chain>/headers`
    pub fn headers_store_path(&self, network: Network) -> Option<PathBuf> {
        self.database_path.as_ref().map(|root| {
            root.join(STORAGE_VERSION)
                .join(network.as_str())
                .join("headers")
        })
    }

    /// `<root>/<version>/<chain>/nodes/legacy`
    pub fn peers_store_path(&self, network: Network) -> Option<PathBuf> {
        self.database_path.as_ref().map(|root| {
            root.join(STORAGE_VERSION)
                .join(network.as_str())
                .join("nodes")
                .join("legacy")
        })
    }
}
