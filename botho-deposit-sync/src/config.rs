//! Configuration for the deposit sync service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::follower::FollowerConfig;
use crate::service::SyncPolicy;
use crate::sweeper::SweeperConfig;

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Chain engine JSON-RPC endpoint
    #[serde(default = "default_node_rpc_url")]
    pub node_rpc_url: String,

    /// Balance ledger JSON-RPC endpoint
    #[serde(default)]
    pub ledger_rpc_url: String,

    /// Bearer token for the ledger channel
    pub ledger_auth_token: Option<String>,

    /// Asset symbol sent with every update
    #[serde(default = "default_asset")]
    pub asset: String,

    /// JSON file of user id -> deposit address fingerprint
    #[serde(default = "default_address_file")]
    pub address_file: PathBuf,

    /// LMDB directory for the durable charge ledger
    #[serde(default = "default_ledger_db_path")]
    pub ledger_db_path: PathBuf,

    /// Follower progress file
    #[serde(default = "default_cursor_file")]
    pub cursor_file: PathBuf,

    /// Confirmations before a deposit is credited
    #[serde(default = "default_maturity_depth")]
    pub maturity_depth: u64,

    /// Extra confirmations before the sweeper re-drives a credit
    #[serde(default = "default_sweep_margin")]
    pub sweep_margin: u64,

    /// Treat coinbase outputs as deposits
    #[serde(default)]
    pub include_coinbase: bool,

    /// Sweeper sleep while blocks are tracked, in seconds
    #[serde(default = "default_sweep_busy_interval")]
    pub sweep_busy_interval_secs: u64,

    /// Sweeper sleep while the ledger is empty, in seconds
    #[serde(default = "default_sweep_idle_interval")]
    pub sweep_idle_interval_secs: u64,

    /// Follower polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Recent blocks the follower remembers for reorg detection
    #[serde(default = "default_reorg_window")]
    pub reorg_window: u64,

    /// Blocks the follower delivers per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Height the follower starts at on first run (default: node tip)
    pub start_height: Option<u64>,

    /// Per-call timeout for node and ledger RPC, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Prometheus `/metrics` listen address
    pub metrics_addr: Option<SocketAddr>,
}

fn default_node_rpc_url() -> String {
    "http://localhost:7101".to_string()
}

fn default_asset() -> String {
    "BTH".to_string()
}

fn default_address_file() -> PathBuf {
    PathBuf::from("deposit_addresses.json")
}

fn default_ledger_db_path() -> PathBuf {
    PathBuf::from("charge_ledger")
}

fn default_cursor_file() -> PathBuf {
    PathBuf::from("follower_cursor.json")
}

fn default_maturity_depth() -> u64 {
    crate::maturity::DEFAULT_MATURITY_DEPTH
}

fn default_sweep_margin() -> u64 {
    5
}

fn default_sweep_busy_interval() -> u64 {
    30
}

fn default_sweep_idle_interval() -> u64 {
    30 * 60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_reorg_window() -> u64 {
    100
}

fn default_batch_size() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_rpc_url: default_node_rpc_url(),
            ledger_rpc_url: String::new(),
            ledger_auth_token: None,
            asset: default_asset(),
            address_file: default_address_file(),
            ledger_db_path: default_ledger_db_path(),
            cursor_file: default_cursor_file(),
            maturity_depth: default_maturity_depth(),
            sweep_margin: default_sweep_margin(),
            include_coinbase: false,
            sweep_busy_interval_secs: default_sweep_busy_interval(),
            sweep_idle_interval_secs: default_sweep_idle_interval(),
            poll_interval_secs: default_poll_interval(),
            reorg_window: default_reorg_window(),
            batch_size: default_batch_size(),
            start_height: None,
            request_timeout_secs: default_request_timeout(),
            metrics_addr: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ledger_rpc_url.trim().is_empty() {
            anyhow::bail!("ledger_rpc_url must be set");
        }
        if self.node_rpc_url.trim().is_empty() {
            anyhow::bail!("node_rpc_url must be set");
        }
        if self.asset.trim().is_empty() {
            anyhow::bail!("asset must not be empty");
        }

        if self.maturity_depth == 0 {
            anyhow::bail!("maturity_depth must be at least 1");
        }

        if self.sweep_busy_interval_secs == 0
            || self.sweep_idle_interval_secs == 0
            || self.poll_interval_secs == 0
            || self.request_timeout_secs == 0
        {
            anyhow::bail!("intervals and timeouts must be non-zero");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be non-zero");
        }

        if self.reorg_window < self.sweep_depth() {
            anyhow::bail!(
                "reorg_window ({}) must be at least maturity_depth + sweep_margin ({})",
                self.reorg_window,
                self.sweep_depth()
            );
        }

        if self.ledger_auth_token.is_none() {
            tracing::warn!("No ledger_auth_token set; ledger requests will be unauthenticated");
        }

        Ok(())
    }

    /// Confirmations before the sweeper re-drives a credit.
    pub fn sweep_depth(&self) -> u64 {
        self.maturity_depth + self.sweep_margin
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            maturity_depth: self.maturity_depth,
            sweep_margin: self.sweep_margin,
            include_coinbase: self.include_coinbase,
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            busy_interval: Duration::from_secs(self.sweep_busy_interval_secs),
            idle_interval: Duration::from_secs(self.sweep_idle_interval_secs),
        }
    }

    pub fn follower(&self) -> FollowerConfig {
        FollowerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            reorg_window: self.reorg_window as usize,
            batch_size: self.batch_size,
            start_height: self.start_height,
        }
    }
}
