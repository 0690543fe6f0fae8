//! Node configuration.
//!
//! Loaded from a TOML or JSON file (picked by extension), validated, then
//! overridden by `TESSERA_*` environment variables and CLI flags.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub fork: ForkConfig,
    #[serde(default)]
    pub groups: GroupSyncConfig,
    #[serde(default)]
    pub txs: TxSyncConfig,
    #[serde(default)]
    pub peers: PeerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Identifier announced in the handshake.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// Outbound peers, `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Hex ed25519 seed for the castor key. Derived from `node_id` when unset.
    #[serde(default)]
    pub key_seed: Option<String>,

    /// Cast a block every N seconds (development networks). 0 disables.
    #[serde(default)]
    pub dev_cast_interval_secs: u64,

    /// Length of one scheduler tick.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_future_blocks")]
    pub future_blocks_cache: usize,
    #[serde(default = "default_verified_cache")]
    pub verified_cache: usize,
    #[serde(default = "default_top_raw_blocks")]
    pub top_raw_blocks: usize,
    /// Ceiling on the encoded transaction body of one block.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_txs")]
    pub max_txs_per_block: usize,
    /// The checkpoint sits this many blocks below the head.
    #[serde(default = "default_checkpoint_depth")]
    pub checkpoint_depth: u64,
    /// qn added by every cast block.
    #[serde(default = "default_qn")]
    pub qn_per_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_three")]
    pub announce_interval_ticks: u64,
    #[serde(default = "default_three")]
    pub try_sync_interval_ticks: u64,
    #[serde(default = "default_sync_timeout")]
    pub timeout_ticks: u64,
    #[serde(default = "default_pool_size")]
    pub candidate_pool_size: usize,
    #[serde(default = "default_max_request")]
    pub max_request_blocks: u64,
    /// Candidates this far ahead count toward "syncing".
    #[serde(default = "default_behind_blocks")]
    pub behind_threshold_blocks: u64,
    #[serde(default = "default_stale_top")]
    pub stale_top_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    #[serde(default = "default_piece_length")]
    pub piece_length: usize,
    #[serde(default = "default_fork_timeout")]
    pub timeout_ticks: u64,
    #[serde(default = "default_max_fork_blocks")]
    pub max_fork_blocks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSyncConfig {
    #[serde(default = "default_ten")]
    pub announce_interval_ticks: u64,
    #[serde(default = "default_ten")]
    pub try_sync_interval_ticks: u64,
    #[serde(default = "default_sync_timeout")]
    pub timeout_ticks: u64,
    #[serde(default = "default_pool_size")]
    pub candidate_pool_size: usize,
    #[serde(default = "default_max_request")]
    pub max_request_groups: u64,
    /// Creating blocks with groups waiting on them.
    #[serde(default = "default_pending_groups")]
    pub pending_cache: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxSyncConfig {
    #[serde(default = "default_five")]
    pub notify_interval_ticks: u64,
    #[serde(default = "default_five")]
    pub request_interval_ticks: u64,
    /// A pooled transaction is announced again only after this long.
    #[serde(default = "default_notify_gap")]
    pub notify_gap_secs: u64,
    /// Hashes per announcement, and per request served.
    #[serde(default = "default_max_notify")]
    pub max_notify_per_round: usize,
    #[serde(default = "default_recent_notified")]
    pub recent_notified_cache: usize,
    /// Peers whose announced hashes are remembered.
    #[serde(default = "default_pool_size")]
    pub candidate_peers: usize,
    #[serde(default = "default_keys_per_peer")]
    pub max_keys_per_peer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_pool_size")]
    pub capacity: usize,
    /// Consecutive timeouts before a ban.
    #[serde(default = "default_evil_threshold")]
    pub evil_threshold: u32,
    #[serde(default = "default_ban_base")]
    pub ban_base_secs: u64,
    #[serde(default = "default_ban_max")]
    pub ban_max_secs: u64,
    /// A peer heard before and silent this long is treated as evil.
    #[serde(default = "default_silence")]
    pub silence_secs: u64,
    #[serde(default = "default_max_request")]
    pub max_req_block_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_map_size")]
    pub map_size_mb: usize,
    /// Skip fsync on commit. Tests only.
    #[serde(default)]
    pub no_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Hex account address.
    pub address: String,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default = "default_genesis_seed")]
    pub seed: String,
    /// Unix milliseconds.
    #[serde(default = "default_genesis_time")]
    pub timestamp: i64,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    /// Hex public keys of the genesis group.
    #[serde(default)]
    pub group_members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub quiet: bool,
}

fn default_node_id() -> String {
    "tessera-node".to_string()
}
fn default_listen() -> String {
    "0.0.0.0:7070".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_tick_millis() -> u64 {
    1_000
}
fn default_future_blocks() -> usize {
    10
}
fn default_verified_cache() -> usize {
    10
}
fn default_top_raw_blocks() -> usize {
    20
}
fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_txs() -> usize {
    1_000
}
fn default_checkpoint_depth() -> u64 {
    400
}
fn default_qn() -> u64 {
    1
}
fn default_three() -> u64 {
    3
}
fn default_ten() -> u64 {
    10
}
fn default_five() -> u64 {
    5
}
fn default_notify_gap() -> u64 {
    60
}
fn default_max_notify() -> usize {
    50
}
fn default_recent_notified() -> usize {
    1_000
}
fn default_keys_per_peer() -> usize {
    1_000
}
fn default_sync_timeout() -> u64 {
    5
}
fn default_pool_size() -> usize {
    100
}
fn default_max_request() -> u64 {
    16
}
fn default_behind_blocks() -> u64 {
    50
}
fn default_stale_top() -> u64 {
    150
}
fn default_piece_length() -> usize {
    10
}
fn default_fork_timeout() -> u64 {
    10
}
fn default_max_fork_blocks() -> u64 {
    2_000
}
fn default_pending_groups() -> usize {
    16
}
fn default_evil_threshold() -> u32 {
    4
}
fn default_ban_base() -> u64 {
    30
}
fn default_ban_max() -> u64 {
    600
}
fn default_silence() -> u64 {
    30
}
fn default_map_size() -> usize {
    1024
}
fn default_genesis_seed() -> String {
    "tessera-genesis".to_string()
}
fn default_genesis_time() -> i64 {
    1_700_000_000_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen: default_listen(),
            peers: Vec::new(),
            data_dir: default_data_dir(),
            key_seed: None,
            dev_cast_interval_secs: 0,
            tick_millis: default_tick_millis(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            future_blocks_cache: default_future_blocks(),
            verified_cache: default_verified_cache(),
            top_raw_blocks: default_top_raw_blocks(),
            max_body_bytes: default_max_body_bytes(),
            max_txs_per_block: default_max_txs(),
            checkpoint_depth: default_checkpoint_depth(),
            qn_per_block: default_qn(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            announce_interval_ticks: default_three(),
            try_sync_interval_ticks: default_three(),
            timeout_ticks: default_sync_timeout(),
            candidate_pool_size: default_pool_size(),
            max_request_blocks: default_max_request(),
            behind_threshold_blocks: default_behind_blocks(),
            stale_top_secs: default_stale_top(),
        }
    }
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            piece_length: default_piece_length(),
            timeout_ticks: default_fork_timeout(),
            max_fork_blocks: default_max_fork_blocks(),
        }
    }
}

impl Default for GroupSyncConfig {
    fn default() -> Self {
        Self {
            announce_interval_ticks: default_ten(),
            try_sync_interval_ticks: default_ten(),
            timeout_ticks: default_sync_timeout(),
            candidate_pool_size: default_pool_size(),
            max_request_groups: default_max_request(),
            pending_cache: default_pending_groups(),
        }
    }
}

impl Default for TxSyncConfig {
    fn default() -> Self {
        Self {
            notify_interval_ticks: default_five(),
            request_interval_ticks: default_five(),
            notify_gap_secs: default_notify_gap(),
            max_notify_per_round: default_max_notify(),
            recent_notified_cache: default_recent_notified(),
            candidate_peers: default_pool_size(),
            max_keys_per_peer: default_keys_per_peer(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_size(),
            evil_threshold: default_evil_threshold(),
            ban_base_secs: default_ban_base(),
            ban_max_secs: default_ban_max(),
            silence_secs: default_silence(),
            max_req_block_count: default_max_request(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            map_size_mb: default_map_size(),
            no_sync: false,
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            seed: default_genesis_seed(),
            timestamp: default_genesis_time(),
            allocations: Vec::new(),
            group_members: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            quiet: false,
        }
    }
}

impl GenesisConfig {
    /// Parsed allocations. Call after `validate`.
    pub fn parsed_allocations(&self) -> Result<Vec<(Hash, u64)>> {
        self.allocations
            .iter()
            .map(|a| {
                Hash::from_hex(&a.address)
                    .map(|addr| (addr, a.balance))
                    .with_context(|| format!("Invalid allocation address {}", a.address))
            })
            .collect()
    }

    pub fn parsed_members(&self) -> Result<Vec<Vec<u8>>> {
        self.group_members
            .iter()
            .map(|m| hex::decode(m).with_context(|| format!("Invalid group member key {}", m)))
            .collect()
    }
}

impl NodeConfig {
    /// Load config from a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: NodeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).context("Failed to parse config JSON")?,
            Some("toml") | None => toml::from_str(&content).context("Failed to parse config TOML")?,
            Some(other) => bail!("Unsupported config extension: .{}", other),
        };
        Ok(config)
    }

    /// Save config as pretty JSON or TOML, by extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self).context("Failed to serialize config")?,
            _ => toml::to_string_pretty(self).context("Failed to serialize config")?,
        };
        fs::write(path, text).context("Failed to write config file")?;
        Ok(())
    }

    /// `TESSERA_DATA_DIR`, `TESSERA_LISTEN`, `TESSERA_PEERS` (comma separated)
    /// and `TESSERA_NODE_ID`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TESSERA_DATA_DIR") {
            if !v.trim().is_empty() {
                self.node.data_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("TESSERA_LISTEN") {
            if !v.trim().is_empty() {
                self.node.listen = v;
            }
        }
        if let Ok(v) = std::env::var("TESSERA_PEERS") {
            if !v.trim().is_empty() {
                self.node.peers = split_peers(&v);
            }
        }
        if let Ok(v) = std::env::var("TESSERA_NODE_ID") {
            if !v.trim().is_empty() {
                self.node.node_id = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            bail!("node.node_id must not be empty");
        }
        if self.node.tick_millis == 0 {
            bail!("node.tick_millis must be positive");
        }
        if let Some(seed) = &self.node.key_seed {
            if crate::crypto::Keypair::from_hex_seed(seed).is_none() {
                bail!("node.key_seed must be 32 bytes of hex");
            }
        }
        if self.chain.future_blocks_cache == 0 || self.chain.verified_cache == 0 || self.chain.top_raw_blocks == 0 {
            bail!("chain cache capacities must be positive");
        }
        if self.chain.checkpoint_depth == 0 {
            bail!("chain.checkpoint_depth must be positive");
        }
        if self.sync.max_request_blocks == 0 || self.sync.max_request_blocks > 16 {
            bail!("sync.max_request_blocks must be in 1..=16");
        }
        if self.peers.max_req_block_count == 0 || self.peers.max_req_block_count > self.sync.max_request_blocks {
            bail!("peers.max_req_block_count must be in 1..=sync.max_request_blocks");
        }
        if self.sync.timeout_ticks == 0 || self.fork.timeout_ticks == 0 || self.groups.timeout_ticks == 0 {
            bail!("timeouts must be at least one tick");
        }
        if self.fork.piece_length == 0 {
            bail!("fork.piece_length must be positive");
        }
        if self.fork.max_fork_blocks == 0 {
            bail!("fork.max_fork_blocks must be positive");
        }
        if self.txs.notify_interval_ticks == 0 || self.txs.request_interval_ticks == 0 {
            bail!("txs intervals must be at least one tick");
        }
        if self.txs.max_notify_per_round == 0
            || self.txs.recent_notified_cache == 0
            || self.txs.candidate_peers == 0
            || self.txs.max_keys_per_peer == 0
        {
            bail!("txs cache capacities must be positive");
        }
        if self.peers.evil_threshold == 0 {
            bail!("peers.evil_threshold must be positive");
        }
        if self.peers.ban_base_secs > self.peers.ban_max_secs {
            bail!("peers.ban_base_secs must not exceed peers.ban_max_secs");
        }
        if self.store.map_size_mb == 0 {
            bail!("store.map_size_mb must be positive");
        }
        self.genesis.parsed_allocations()?;
        self.genesis.parsed_members()?;
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("Invalid log level: {}", other),
        }
        Ok(())
    }
}

pub fn split_peers(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
