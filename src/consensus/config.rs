use crate::consensus::error::ConfigError;
use crate::consensus::types::{Hash, PublicKey, Server};
use hex::FromHex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub network_id: String,
    pub federated_servers: Vec<ServerConfig>,
    #[serde(default)]
    pub audit_servers: Vec<ServerConfig>,
    #[serde(default)]
    pub factoid_balances: Vec<BalanceConfig>,
    #[serde(default)]
    pub entry_credit_balances: Vec<BalanceConfig>,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub pubkey_hex: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceConfig {
    pub address_hex: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_block_time")]
    pub block_time_ms: u64,
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: u64,
    #[serde(default = "default_catchup_interval")]
    pub catchup_interval_ms: u64,
    #[serde(default = "default_max_catchup")]
    pub max_catchup_heights: u32,
    #[serde(default = "default_keep")]
    pub dbstate_keep: usize,
    /// Pending-state advancement attempts after each leader execution.
    #[serde(default = "default_progress_budget")]
    pub progress_budget: usize,
    #[serde(default = "default_queue_capacity")]
    pub ack_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub msg_queue_capacity: usize,
    /// Heights between storage trims.
    #[serde(default = "default_trim_interval")]
    pub trim_interval: u64,
    #[serde(default = "default_factoshis_per_ec")]
    pub factoshis_per_ec: u64,
}

pub const DEFAULT_PROGRESS_BUDGET: usize = 10;

fn default_block_time() -> u64 {
    600_000
}

fn default_start_delay() -> u64 {
    5_000
}

fn default_catchup_interval() -> u64 {
    3_000
}

fn default_max_catchup() -> u32 {
    400
}

fn default_keep() -> usize {
    2
}

fn default_progress_budget() -> usize {
    DEFAULT_PROGRESS_BUDGET
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_trim_interval() -> u64 {
    1_000
}

fn default_factoshis_per_ec() -> u64 {
    1_000
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_time_ms: default_block_time(),
            start_delay_ms: default_start_delay(),
            catchup_interval_ms: default_catchup_interval(),
            max_catchup_heights: default_max_catchup(),
            dbstate_keep: default_keep(),
            progress_budget: default_progress_budget(),
            ack_queue_capacity: default_queue_capacity(),
            msg_queue_capacity: default_queue_capacity(),
            trim_interval: default_trim_interval(),
            factoshis_per_ec: default_factoshis_per_ec(),
        }
    }
}

impl ConsensusConfig {
    /// Interval between local EOM ticks.
    pub fn minute_ms(&self) -> u64 {
        (self.block_time_ms / 10).max(1)
    }
}

impl GenesisConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn fed_servers(&self) -> Result<Vec<Server>, ConfigError> {
        if self.federated_servers.is_empty() {
            return Err(ConfigError::NoFederatedServers);
        }
        to_servers(&self.federated_servers)
    }

    pub fn audit_servers(&self) -> Result<Vec<Server>, ConfigError> {
        to_servers(&self.audit_servers)
    }

    pub fn factoid_balances(&self) -> Result<Vec<(Hash, u64)>, ConfigError> {
        to_balances(&self.factoid_balances)
    }

    pub fn entry_credit_balances(&self) -> Result<Vec<(PublicKey, u64)>, ConfigError> {
        to_balances(&self.entry_credit_balances)
    }
}

fn to_servers(list: &[ServerConfig]) -> Result<Vec<Server>, ConfigError> {
    let mut out = Vec::with_capacity(list.len());
    for (i, s) in list.iter().enumerate() {
        let name = if s.name.is_empty() {
            format!("server{}", i)
        } else {
            s.name.clone()
        };
        let pubkey = parse_pubkey(&s.pubkey_hex).map_err(|_| ConfigError::BadPubkey(name.clone()))?;
        out.push(Server::new(pubkey, name));
    }
    Ok(out)
}

fn to_balances(list: &[BalanceConfig]) -> Result<Vec<(Hash, u64)>, ConfigError> {
    list.iter()
        .map(|b| {
            <[u8; 32]>::from_hex(b.address_hex.trim())
                .map(|addr| (addr, b.amount))
                .map_err(|_| ConfigError::BadAddress(b.address_hex.clone()))
        })
        .collect()
}

pub fn parse_pubkey(hex_str: &str) -> Result<PublicKey, hex::FromHexError> {
    <[u8; 32]>::from_hex(hex_str.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_defaults_fill_missing_fields() {
        let json = r#"{
            "network_id": "local",
            "federated_servers": [{"pubkey_hex": "0101010101010101010101010101010101010101010101010101010101010101"}],
            "consensus": {"block_time_ms": 1000}
        }"#;
        let g = GenesisConfig::from_json(json).expect("parse");
        assert_eq!(g.consensus.block_time_ms, 1000);
        assert_eq!(g.consensus.minute_ms(), 100);
        assert_eq!(g.consensus.progress_budget, DEFAULT_PROGRESS_BUDGET);
        assert_eq!(g.consensus.max_catchup_heights, 400);
        assert_eq!(g.consensus.dbstate_keep, 2);
        let fed = g.fed_servers().expect("servers");
        assert_eq!(fed[0].name, "server0");
        assert!(g.audit_servers().expect("audit").is_empty());
    }

    #[test]
    fn bad_inputs_are_reported() {
        let g = GenesisConfig::from_json(
            r#"{"network_id": "x", "federated_servers": [{"pubkey_hex": "zz", "name": "a"}]}"#,
        )
        .expect("parse");
        assert!(matches!(g.fed_servers(), Err(ConfigError::BadPubkey(n)) if n == "a"));

        let empty = GenesisConfig::from_json(r#"{"network_id": "x", "federated_servers": []}"#)
            .expect("parse");
        assert!(matches!(empty.fed_servers(), Err(ConfigError::NoFederatedServers)));
        assert!(GenesisConfig::from_json("{").is_err());
    }
}
