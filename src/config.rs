use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Peer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Proposes, validates and votes as a member of the peer set.
    Delegate,
    /// Follows the chain through height-based sync only.
    Full,
    /// Delegate when the node's own address is listed in `peers`, full otherwise.
    #[default]
    Adaptive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    #[serde(default)]
    pub mode: NodeMode,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    #[serde(default = "default_pack_margin_ms")]
    pub pack_margin_ms: u64,
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
    #[serde(default = "default_contract_timeout_ms")]
    pub contract_timeout_ms: u64,
    #[serde(default)]
    pub vote_resend_interval_ms: Option<u64>,
    #[serde(default = "default_sync_failure_threshold")]
    pub sync_failure_threshold: u32,
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

fn default_chain_id() -> u64 {
    1
}

fn default_block_interval_ms() -> u64 {
    3_000
}

fn default_pack_margin_ms() -> u64 {
    500
}

fn default_drain_batch_size() -> usize {
    20
}

fn default_contract_timeout_ms() -> u64 {
    200
}

fn default_sync_failure_threshold() -> u32 {
    3
}

fn default_pool_limit() -> usize {
    8_192
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.block_interval_ms == 0 {
            return Err(ChainError::Config("block_interval_ms must be positive".into()));
        }
        if self.pack_margin_ms >= self.block_interval_ms {
            return Err(ChainError::Config(
                "pack_margin_ms must be smaller than block_interval_ms".into(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(ChainError::Config("drain_batch_size must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.account.as_str()) {
                return Err(ChainError::Config(format!(
                    "peer {} listed more than once",
                    peer.account
                )));
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn vote_resend_interval(&self) -> Duration {
        Duration::from_millis(
            self.vote_resend_interval_ms
                .unwrap_or(self.block_interval_ms),
        )
    }

    pub fn contract_timeout(&self) -> Duration {
        Duration::from_millis(self.contract_timeout_ms)
    }

    pub fn round_peers(&self) -> Vec<Peer> {
        self.peers.iter().map(PeerConfig::to_peer).collect()
    }

    /// Resolves `Adaptive` against the configured peer list.
    pub fn effective_mode(&self, own_address: &str) -> NodeMode {
        match self.mode {
            NodeMode::Adaptive => {
                if self.peers.iter().any(|peer| peer.account == own_address) {
                    NodeMode::Delegate
                } else {
                    NodeMode::Full
                }
            }
            mode => mode,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: SocketAddr::from(([127, 0, 0, 1], 19951)),
            mode: NodeMode::default(),
            chain_id: default_chain_id(),
            block_interval_ms: default_block_interval_ms(),
            pack_margin_ms: default_pack_margin_ms(),
            drain_batch_size: default_drain_batch_size(),
            contract_timeout_ms: default_contract_timeout_ms(),
            vote_resend_interval_ms: None,
            sync_failure_threshold: default_sync_failure_threshold(),
            pool_limit: default_pool_limit(),
            peers: Vec::new(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub account: Address,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_peer_weight")]
    pub weight: u32,
}

fn default_peer_weight() -> u32 {
    1
}

impl PeerConfig {
    pub fn to_peer(&self) -> Peer {
        Peer {
            account: self.account.clone(),
            address: self.address.clone(),
            port: self.port,
            weight: self.weight,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub accounts: Vec<GenesisAccount>,
    /// Tokens registered at genesis; each issuer is credited the full supply.
    #[serde(default)]
    pub tokens: Vec<GenesisToken>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub amount: i64,
    #[serde(default)]
    pub gas: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisToken {
    pub address: Address,
    pub name: String,
    pub decimals: u8,
    pub total: i64,
    pub issuer: Address,
}
