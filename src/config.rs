//! Service configuration loaded from a JSON file.

use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Interval between manager loop ticks.
pub const PLT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// A validator add/del on Palette stabilizes within four blocks; one more
/// block tolerates a chain fork, one is margin.
pub const DEFAULT_BLOCK_DISTANCE: u64 = 6;

/// Root configuration structure, deserialized from the JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "PolyConfig")]
    pub poly: PolyConfig,
    #[serde(rename = "PaletteConfig")]
    pub palette: PaletteConfig,
    #[serde(rename = "BoltDbPath", default)]
    pub bolt_db_path: String,
    #[serde(rename = "TargetContracts", default)]
    pub target_contracts: TargetContracts,
    #[serde(rename = "RoutineNum", default = "default_routine_num")]
    pub routine_num: usize,
    #[serde(rename = "MetricsPort", default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolyConfig {
    #[serde(rename = "RestURL")]
    pub rest_url: String,
    #[serde(rename = "WalletFile")]
    pub wallet_file: String,
    #[serde(rename = "WalletPwd")]
    pub wallet_pwd: String,
    #[serde(rename = "EntranceContractAddress")]
    pub entrance_contract_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaletteConfig {
    #[serde(rename = "RestURL")]
    pub rest_url: String,
    #[serde(rename = "SideChainId")]
    pub side_chain_id: u64,
    #[serde(rename = "ECCMContractAddress")]
    pub eccm_contract_address: Address,
    #[serde(rename = "ECCDContractAddress")]
    pub eccd_contract_address: Address,
    #[serde(rename = "BlockConfig", default)]
    pub block_config: u64,
    #[serde(rename = "KeyStorePath")]
    pub key_store_path: String,
    #[serde(rename = "KeyStorePwdSet", default)]
    pub key_store_pwd_set: HashMap<String, String>,
    #[serde(rename = "GasPrice", default)]
    pub gas_price: u64,
    #[serde(rename = "GasLimit", default)]
    pub gas_limit: u64,
}

/// Per-chain allow-lists of cross-chain contracts. An empty direction list
/// admits every contract for that chain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetContracts(pub Vec<HashMap<u64, DirectionLists>>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectionLists {
    #[serde(default)]
    pub inbound: Vec<Address>,
    #[serde(default)]
    pub outbound: Vec<Address>,
}

impl TargetContracts {
    fn check(&self, chain_id: u64, contract: Address, inbound: bool) -> bool {
        for entry in &self.0 {
            if let Some(lists) = entry.get(&chain_id) {
                let list = if inbound { &lists.inbound } else { &lists.outbound };
                return list.is_empty() || list.contains(&contract);
            }
        }
        false
    }

    /// Is a Palette lock event bound for `to_chain` from `contract` relayable?
    pub fn check_outbound(&self, to_chain: u64, contract: Address) -> bool {
        self.check(to_chain, contract, false)
    }

    /// Is a Poly cross-chain message from `contract` on `from_chain` relayable?
    pub fn check_inbound(&self, from_chain: u64, contract: Address) -> bool {
        self.check(from_chain, contract, true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn default_routine_num() -> usize {
    64
}

impl ServiceConfig {
    /// Load and validate the configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> RelayerResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayerError::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: ServiceConfig = serde_json::from_str(&raw)
            .map_err(|e| RelayerError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> RelayerResult<()> {
        if self.poly.rest_url.is_empty() {
            return Err(RelayerError::Config("PolyConfig.RestURL is empty".into()));
        }
        if self.palette.rest_url.is_empty() {
            return Err(RelayerError::Config("PaletteConfig.RestURL is empty".into()));
        }
        if self.target_contracts.is_empty() {
            return Err(RelayerError::Config("no target contracts".into()));
        }
        if self.routine_num == 0 {
            return Err(RelayerError::Config("RoutineNum must be positive".into()));
        }
        Ok(())
    }

    /// Path of the embedded database; `"boltdb"` when not configured.
    pub fn db_path(&self) -> &str {
        if self.bolt_db_path.is_empty() {
            "boltdb"
        } else {
            &self.bolt_db_path
        }
    }

    /// The fork-safety distance enforced before proofs are built (§ deposit
    /// loop); never below [`DEFAULT_BLOCK_DISTANCE`].
    pub fn safe_block_distance(&self) -> u64 {
        self.palette.block_config.max(DEFAULT_BLOCK_DISTANCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServiceConfig {
        let raw = r#"{
            "PolyConfig": {
                "RestURL": "http://127.0.0.1:20336",
                "WalletFile": "./wallet.dat",
                "WalletPwd": "pwd",
                "EntranceContractAddress": "0300000000000000000000000000000000000000"
            },
            "PaletteConfig": {
                "RestURL": "http://127.0.0.1:22000",
                "SideChainId": 101,
                "ECCMContractAddress": "0x0000000000000000000000000000000000000103",
                "ECCDContractAddress": "0x0000000000000000000000000000000000000102",
                "BlockConfig": 4,
                "KeyStorePath": "./keystore",
                "KeyStorePwdSet": { "0x5593b2b8dc63d0ed68aa8f885707b2dc5787e391": "pwd" },
                "GasPrice": 1000000000,
                "GasLimit": 2100000
            },
            "TargetContracts": [
                { "101": { "outbound": ["0x0000000000000000000000000000000000000103"], "inbound": [] } }
            ],
            "RoutineNum": 8
        }"#;
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn parse_service_config() {
        let cfg = sample();
        assert_eq!(cfg.palette.side_chain_id, 101);
        assert_eq!(cfg.routine_num, 8);
        assert_eq!(cfg.db_path(), "boltdb");
        cfg.validate().unwrap();
    }

    #[test]
    fn distance_never_below_default() {
        let mut cfg = sample();
        assert_eq!(cfg.safe_block_distance(), DEFAULT_BLOCK_DISTANCE);
        cfg.palette.block_config = 12;
        assert_eq!(cfg.safe_block_distance(), 12);
    }

    #[test]
    fn outbound_allow_list() {
        let cfg = sample();
        let eccm: Address = "0x0000000000000000000000000000000000000103".parse().unwrap();
        let other: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        assert!(cfg.target_contracts.check_outbound(101, eccm));
        assert!(!cfg.target_contracts.check_outbound(101, other));
        // unknown chain: nothing is relayed
        assert!(!cfg.target_contracts.check_outbound(7, eccm));
        // empty inbound list admits everything for a configured chain
        assert!(cfg.target_contracts.check_inbound(101, other));
    }
}
