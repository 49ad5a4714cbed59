use crate::config::ConfigError;
use crate::crypto::{Hash, Signature, sha256};
use crate::state::{balance_key, encode_amount};
use crate::types::{Address, Block, BlockHeader, Operation, Transaction, merkle_root};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// Gas pricing. Fee = `base_fee + per_byte_fee * tx_size_bytes`.
/// Amounts appear in the genesis file as decimal strings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GasConfig {
    #[serde(with = "decimal")]
    pub base_fee: BigUint,
    #[serde(with = "decimal")]
    pub per_byte_fee: BigUint,
}

impl GasConfig {
    pub fn fee_for(&self, size_bytes: usize) -> BigUint {
        &self.base_fee + &self.per_byte_fee * BigUint::from(size_bytes)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub decimals: u8,
}

/// The genesis file. Byte-identical across all replicas of one network;
/// its SHA-256 is the network identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub timestamp: i64,
    pub authorities: Vec<Address>,
    #[serde(default)]
    pub initial_state: BTreeMap<String, String>,
    #[serde(default)]
    pub token_config: Option<TokenConfig>,
    #[serde(default)]
    pub gas_config: Option<GasConfig>,
    /// Address -> decimal amount, minted at genesis.
    #[serde(default)]
    pub initial_balances: BTreeMap<String, String>,
}

impl GenesisConfig {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: GenesisConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate; also returns the network id.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Self, Hash), ConfigError> {
        let bytes = std::fs::read(path)?;
        let network_id = sha256(&bytes);
        let config = Self::from_bytes(&bytes)?;
        Ok((config, network_id))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timestamp <= 0 {
            return Err(ConfigError::BadTimestamp);
        }
        if self.authorities.is_empty() {
            return Err(ConfigError::EmptyAuthorities);
        }
        let mut seen = HashSet::new();
        for authority in &self.authorities {
            if !seen.insert(*authority) {
                return Err(ConfigError::DuplicateAuthority(*authority));
            }
        }
        if let Some(token) = &self.token_config {
            if token.name.is_empty() || token.symbol.is_empty() {
                return Err(ConfigError::BadTokenConfig(
                    "name and symbol must be non-empty".into(),
                ));
            }
        }
        for (addr, amount) in &self.initial_balances {
            Address::from_str(addr).map_err(|_| ConfigError::BadAddress(addr.clone()))?;
            BigUint::from_str(amount).map_err(|_| ConfigError::BadAmount(addr.clone()))?;
        }
        Ok(())
    }

    /// Header version 2 marks a gas-enabled chain.
    pub fn header_version(&self) -> u32 {
        if self.gas_config.is_some() { 2 } else { 1 }
    }

    /// Build the genesis block: one unsigned transaction from the genesis
    /// address carrying the initial state writes and balance mints. The
    /// state root is filled in when the chain initializes.
    pub fn build_block(&self) -> Result<Block, ConfigError> {
        let mut operations = Vec::new();
        for (key, value) in &self.initial_state {
            operations.push(Operation::Set {
                key: key.clone(),
                value: value.clone().into_bytes(),
            });
        }
        for (addr, amount) in &self.initial_balances {
            let address =
                Address::from_str(addr).map_err(|_| ConfigError::BadAddress(addr.clone()))?;
            let amount =
                BigUint::from_str(amount).map_err(|_| ConfigError::BadAmount(addr.clone()))?;
            operations.push(Operation::Mint {
                key: balance_key(&address),
                amount: encode_amount(&amount),
            });
        }

        let transactions = if operations.is_empty() {
            Vec::new()
        } else {
            vec![Transaction::genesis(self.timestamp, operations)]
        };

        Ok(Block {
            header: BlockHeader {
                version: self.header_version(),
                height: 0,
                previous_hash: Hash::ZERO,
                timestamp: self.timestamp,
                merkle_root: merkle_root(&transactions),
                state_root: Hash::ZERO,
                producer_addr: Address::GENESIS,
                nonce: 0,
            },
            transactions,
            signature: Signature::empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> String {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes).to_hex()
    }

    fn minimal_genesis() -> String {
        format!(
            r#"{{"timestamp":1704556800,"authorities":["{}","{}","{}"],"initial_state":{{"chain:name":"Podoru Chain"}}}}"#,
            addr(0xa),
            addr(0xb),
            addr(0xc)
        )
    }

    #[test]
    fn parse_and_build() {
        let config = GenesisConfig::from_bytes(minimal_genesis().as_bytes()).unwrap();
        assert_eq!(config.authorities.len(), 3);
        assert_eq!(config.header_version(), 1);

        let block = config.build_block().unwrap();
        assert_eq!(block.header.height, 0);
        assert!(block.header.previous_hash.is_zero());
        assert!(block.signature.is_empty());
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_genesis());
    }

    #[test]
    fn duplicate_authorities_rejected() {
        let json = format!(
            r#"{{"timestamp":1,"authorities":["{}","{}"]}}"#,
            addr(1),
            addr(1)
        );
        assert!(matches!(
            GenesisConfig::from_bytes(json.as_bytes()),
            Err(ConfigError::DuplicateAuthority(_))
        ));
    }

    #[test]
    fn empty_authorities_rejected() {
        let json = r#"{"timestamp":1,"authorities":[]}"#;
        assert!(matches!(
            GenesisConfig::from_bytes(json.as_bytes()),
            Err(ConfigError::EmptyAuthorities)
        ));
    }

    #[test]
    fn bad_balance_amount_rejected() {
        let json = format!(
            r#"{{"timestamp":1,"authorities":["{}"],"initial_balances":{{"{}":"ten"}}}}"#,
            addr(1),
            addr(2)
        );
        assert!(matches!(
            GenesisConfig::from_bytes(json.as_bytes()),
            Err(ConfigError::BadAmount(_))
        ));
    }

    #[test]
    fn gas_config_flips_header_version() {
        let json = format!(
            r#"{{"timestamp":1,"authorities":["{}"],"gas_config":{{"base_fee":"10","per_byte_fee":"1"}}}}"#,
            addr(1)
        );
        let config = GenesisConfig::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(config.header_version(), 2);
        let gas = config.gas_config.unwrap();
        assert_eq!(gas.fee_for(100), BigUint::from(110u32));
    }

    #[test]
    fn balances_become_mint_operations() {
        let json = format!(
            r#"{{"timestamp":1,"authorities":["{}"],"initial_balances":{{"{}":"1000"}}}}"#,
            addr(1),
            addr(2)
        );
        let config = GenesisConfig::from_bytes(json.as_bytes()).unwrap();
        let block = config.build_block().unwrap();
        let ops = &block.transactions[0].data.operations;
        assert!(matches!(&ops[0], Operation::Mint { key, .. } if key.starts_with("balance:0x")));
    }

    #[test]
    fn network_id_tracks_file_bytes() {
        // same bytes, same id; any edit shifts it
        let id = sha256(minimal_genesis().as_bytes());
        assert_eq!(id, sha256(minimal_genesis().as_bytes()));
        let edited = minimal_genesis().replace("Podoru", "Other");
        assert_ne!(id, sha256(edited.as_bytes()));
    }
}

mod decimal {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::from_str(&s).map_err(serde::de::Error::custom)
    }
}
