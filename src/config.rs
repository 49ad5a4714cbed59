use crate::types::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("bad genesis json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("bad block time {0:?}")]
    BadBlockTime(String),
    #[error("duplicate authority {0}")]
    DuplicateAuthority(Address),
    #[error("no authorities configured")]
    EmptyAuthorities,
    #[error("bad amount for {0}")]
    BadAmount(String),
    #[error("bad genesis timestamp")]
    BadTimestamp,
    #[error("bad token config: {0}")]
    BadTokenConfig(String),
    #[error("bad address {0:?}")]
    BadAddress(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Producer,
    Full,
}

fn default_p2p_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_peers() -> usize {
    50
}

fn default_block_time() -> String {
    "5s".to_string()
}

/// Node configuration, loaded from YAML.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    pub node_type: NodeType,
    /// Producer address; must match the loaded private key.
    #[serde(default)]
    pub address: Option<Address>,
    /// Path to the hex-encoded secp256k1 secret. Producers only.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    pub p2p_port: u16,
    #[serde(default = "default_p2p_bind")]
    pub p2p_bind_addr: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default)]
    pub api_enabled: bool,
    #[serde(default = "default_api_bind")]
    pub api_bind_addr: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub genesis_path: PathBuf,
    /// Optional operator-side copy; the genesis file stays authoritative.
    #[serde(default)]
    pub authorities: Vec<Address>,
    #[serde(default = "default_block_time")]
    pub block_time: String,
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_type == NodeType::Producer {
            if self.address.is_none() {
                return Err(ConfigError::MissingField("address"));
            }
            if self.private_key.is_none() {
                return Err(ConfigError::MissingField("private_key"));
            }
        }
        parse_block_time(&self.block_time)?;
        Ok(())
    }

    pub fn block_time(&self) -> Duration {
        // validated at load time
        parse_block_time(&self.block_time).unwrap_or(Duration::from_secs(5))
    }

    pub fn p2p_listen_addr(&self) -> String {
        format!("{}:{}", self.p2p_bind_addr, self.p2p_port)
    }
}

/// Parse a duration string such as `500ms`, `5s`, `2m` or `1h`.
pub fn parse_block_time(s: &str) -> Result<Duration, ConfigError> {
    let text = s.trim();
    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => text.split_at(pos),
        None => (text, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::BadBlockTime(s.to_string()))?;
    if value == 0 {
        return Err(ConfigError::BadBlockTime(s.to_string()));
    }
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(ConfigError::BadBlockTime(s.to_string())),
    };
    Ok(duration)
}
