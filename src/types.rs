use crate::crypto::{self, CryptoError, Hash, Keypair, Signature, sha256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const MAX_KEY_LEN: usize = 1024;
pub const MAX_VALUE_LEN: usize = 1024 * 1024;
pub const MAX_TX_SIZE: usize = 1024 * 1024;
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;
pub const MAX_BLOCK_TXS: usize = 1000;
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 30;

pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("bad height: expected {expected}, got {got}")]
    BadHeight { expected: u64, got: u64 },
    #[error("previous hash does not match parent")]
    BadPreviousHash,
    #[error("bad timestamp: {0}")]
    BadTimestamp(String),
    #[error("bad version: expected {expected}, got {got}")]
    BadVersion { expected: u32, got: u32 },
    #[error("{0} is not an authority")]
    NotAuthority(Address),
    #[error("merkle root does not match transactions")]
    BadMerkleRoot,
    #[error("state root does not match post-execution state")]
    BadStateRoot,
    #[error("block exceeds {MAX_BLOCK_SIZE} bytes ({0})")]
    OversizeBlock(usize),
    #[error("block holds {0} transactions, maximum is {MAX_BLOCK_TXS}")]
    TooManyTransactions(usize),
    #[error("bad operation: {0}")]
    BadOperation(String),
    #[error("insufficient balance for {0}")]
    InsufficientBalance(String),
    #[error("unauthorized mint by {0}")]
    UnauthorizedMint(Address),
}

impl From<CryptoError> for ValidationError {
    fn from(e: CryptoError) -> Self {
        ValidationError::BadSignature(e.to_string())
    }
}

/// A 20-byte account identifier derived from a secp256k1 public key.
/// Serialized as lower-case hex with a `0x` prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// The all-zero address that authors genesis state and never signs.
    pub const GENESIS: Address = Address([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(hex_part)
            .map_err(|e| ValidationError::BadOperation(format!("bad address {trimmed}: {e}")))?;
        if bytes.len() != 20 {
            return Err(ValidationError::BadOperation(format!(
                "address must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex-string serde for raw byte payloads.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A single key-value operation inside a transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Set {
        key: String,
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    /// Additive credit to a balance key. Authority-only outside genesis.
    Mint {
        key: String,
        #[serde(with = "hex_bytes")]
        amount: Vec<u8>,
    },
    /// Move an amount from the sender's balance to the recipient balance key.
    Transfer {
        key: String,
        #[serde(with = "hex_bytes")]
        amount: Vec<u8>,
    },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Operation::Set { key, .. }
            | Operation::Delete { key }
            | Operation::Mint { key, .. }
            | Operation::Transfer { key, .. } => key,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key().is_empty() {
            return Err(ValidationError::BadOperation("empty key".into()));
        }
        if self.key().len() > MAX_KEY_LEN {
            return Err(ValidationError::BadOperation(format!(
                "key exceeds {MAX_KEY_LEN} bytes"
            )));
        }
        if let Operation::Set { value, .. } = self {
            if value.is_empty() {
                return Err(ValidationError::BadOperation("empty SET value".into()));
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(ValidationError::BadOperation(format!(
                    "value exceeds {MAX_VALUE_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    fn canonical_json(&self, out: &mut String) {
        match self {
            Operation::Set { key, value } => {
                out.push_str("{\"type\":\"set\",\"key\":");
                escape_json_string(key, out);
                out.push_str(",\"value\":\"");
                out.push_str(&hex::encode(value));
                out.push_str("\"}");
            }
            Operation::Delete { key } => {
                out.push_str("{\"type\":\"delete\",\"key\":");
                escape_json_string(key, out);
                out.push('}');
            }
            Operation::Mint { key, amount } => {
                out.push_str("{\"type\":\"mint\",\"key\":");
                escape_json_string(key, out);
                out.push_str(",\"amount\":\"");
                out.push_str(&hex::encode(amount));
                out.push_str("\"}");
            }
            Operation::Transfer { key, amount } => {
                out.push_str("{\"type\":\"transfer\",\"key\":");
                escape_json_string(key, out);
                out.push_str(",\"amount\":\"");
                out.push_str(&hex::encode(amount));
                out.push_str("\"}");
            }
        }
    }
}

/// Canonical JSON string escaping. Hash preimages must not depend on a
/// serializer's escape choices.
fn escape_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionData {
    pub operations: Vec<Operation>,
}

impl TransactionData {
    fn canonical_json(&self, out: &mut String) {
        out.push_str("{\"operations\":[");
        for (i, op) in self.operations.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            op.canonical_json(out);
        }
        out.push_str("]}");
    }
}

/// A signed key-value transaction.
///
/// The id is SHA-256 over the canonical encoding of `{from, timestamp, data,
/// nonce}`. It may travel on the wire but verifiers always recompute it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub timestamp: i64,
    pub nonce: u64,
    pub data: TransactionData,
    pub signature: Signature,
    pub id: Hash,
}

impl Transaction {
    pub fn new(from: Address, timestamp: i64, nonce: u64, operations: Vec<Operation>) -> Self {
        let mut tx = Transaction {
            from,
            timestamp,
            nonce,
            data: TransactionData { operations },
            signature: Signature::empty(),
            id: Hash::ZERO,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// A genesis transaction: authored by the genesis address, unsigned.
    pub fn genesis(timestamp: i64, operations: Vec<Operation>) -> Self {
        Transaction::new(Address::GENESIS, timestamp, 0, operations)
    }

    /// The signing preimage: fixed field order, no whitespace, id and
    /// signature excluded.
    pub fn signing_payload(&self) -> String {
        let mut out = String::with_capacity(128);
        out.push_str("{\"from\":\"");
        out.push_str(&self.from.to_hex());
        out.push_str("\",\"timestamp\":");
        out.push_str(&self.timestamp.to_string());
        out.push_str(",\"data\":");
        self.data.canonical_json(&mut out);
        out.push_str(",\"nonce\":");
        out.push_str(&self.nonce.to_string());
        out.push('}');
        out
    }

    pub fn compute_id(&self) -> Hash {
        sha256(self.signing_payload().as_bytes())
    }

    /// Canonical encoding of the whole transaction. Its length is the size
    /// used for fee computation.
    pub fn canonical_json(&self) -> String {
        let mut out = self.signing_payload();
        out.pop();
        out.push_str(",\"signature\":\"");
        out.push_str(&self.signature.to_hex());
        out.push_str("\",\"id\":\"");
        out.push_str(&self.compute_id().to_hex());
        out.push_str("\"}");
        out
    }

    pub fn byte_size(&self) -> usize {
        self.canonical_json().len()
    }

    pub fn is_genesis(&self) -> bool {
        self.from.is_genesis() && self.signature.is_empty()
    }

    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), CryptoError> {
        self.id = self.compute_id();
        self.signature = keypair.sign(&self.id)?;
        Ok(())
    }

    pub fn recover_signer(&self) -> Result<Address, ValidationError> {
        let digest = self.compute_id();
        Ok(crypto::recover_address(&digest, &self.signature)?)
    }

    /// Structural and cryptographic validation of a signed transaction.
    /// Nonce and balance checks happen at execution time.
    pub fn verify(&self) -> Result<(), ValidationError> {
        if self.data.operations.is_empty() {
            return Err(ValidationError::BadOperation("empty operation list".into()));
        }
        for op in &self.data.operations {
            op.validate()?;
        }
        if self.byte_size() > MAX_TX_SIZE {
            return Err(ValidationError::BadOperation(format!(
                "transaction exceeds {MAX_TX_SIZE} bytes"
            )));
        }
        if self.signature.is_empty() {
            return Err(ValidationError::BadSignature("missing signature".into()));
        }
        let signer = self.recover_signer()?;
        if signer != self.from {
            return Err(ValidationError::BadSignature(format!(
                "recovered {signer}, expected {}",
                self.from
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    pub previous_hash: Hash,
    pub timestamp: i64,
    pub merkle_root: Hash,
    pub state_root: Hash,
    pub producer_addr: Address,
    pub nonce: u64,
}

impl BlockHeader {
    /// The hash preimage: fields in declaration order, no whitespace.
    pub fn canonical_json(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("{\"version\":");
        out.push_str(&self.version.to_string());
        out.push_str(",\"height\":");
        out.push_str(&self.height.to_string());
        out.push_str(",\"previous_hash\":\"");
        out.push_str(&self.previous_hash.to_hex());
        out.push_str("\",\"timestamp\":");
        out.push_str(&self.timestamp.to_string());
        out.push_str(",\"merkle_root\":\"");
        out.push_str(&self.merkle_root.to_hex());
        out.push_str("\",\"state_root\":\"");
        out.push_str(&self.state_root.to_hex());
        out.push_str("\",\"producer_addr\":\"");
        out.push_str(&self.producer_addr.to_hex());
        out.push_str("\",\"nonce\":");
        out.push_str(&self.nonce.to_string());
        out.push('}');
        out
    }

    pub fn hash(&self) -> Hash {
        sha256(self.canonical_json().as_bytes())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub signature: Signature,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0
    }

    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), CryptoError> {
        self.signature = keypair.sign(&self.hash())?;
        Ok(())
    }

    pub fn recover_producer(&self) -> Result<Address, ValidationError> {
        Ok(crypto::recover_address(&self.hash(), &self.signature)?)
    }

    pub fn canonical_json(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("{\"header\":");
        out.push_str(&self.header.canonical_json());
        out.push_str(",\"transactions\":[");
        for (i, tx) in self.transactions.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&tx.canonical_json());
        }
        out.push_str("],\"signature\":\"");
        out.push_str(&self.signature.to_hex());
        out.push_str("\"}");
        out
    }

    pub fn byte_size(&self) -> usize {
        self.canonical_json().len()
    }
}

/// Pairwise SHA-256 tree. The last leaf is duplicated on odd levels; an
/// empty list hashes to all zeros; a single leaf is its own root.
pub fn merkle_from_hashes(mut leaves: Vec<Hash>) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }
    while leaves.len() > 1 {
        if leaves.len() % 2 != 0 {
            leaves.push(*leaves.last().unwrap());
        }
        let mut next_level = Vec::with_capacity(leaves.len() / 2);
        for chunk in leaves.chunks(2) {
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&chunk[0].0);
            data.extend_from_slice(&chunk[1].0);
            next_level.push(sha256(&data));
        }
        leaves = next_level;
    }
    leaves[0]
}

pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    merkle_from_hashes(transactions.iter().map(|tx| tx.compute_id()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_op(key: &str, value: &str) -> Operation {
        Operation::Set {
            key: key.into(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn address_parsing_is_case_insensitive() {
        let a = Address::from_str("0xAbCd000000000000000000000000000000000001").unwrap();
        let b = Address::from_str("0xabcd000000000000000000000000000000000001").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), "0xabcd000000000000000000000000000000000001");
    }

    #[test]
    fn transaction_id_excludes_signature() {
        let keypair = Keypair::generate();
        let mut tx = Transaction::new(keypair.address(), 1704556800, 0, vec![set_op("k", "v")]);
        let before = tx.compute_id();
        tx.sign(&keypair).unwrap();
        assert_eq!(tx.compute_id(), before);
    }

    #[test]
    fn transaction_verify_round_trip() {
        let keypair = Keypair::generate();
        let mut tx = Transaction::new(keypair.address(), 1704556800, 0, vec![set_op("k", "v")]);
        tx.sign(&keypair).unwrap();
        tx.verify().unwrap();

        // wrong sender claim fails the recovery comparison
        let other = Keypair::generate();
        tx.from = other.address();
        assert!(matches!(tx.verify(), Err(ValidationError::BadSignature(_))));
    }

    #[test]
    fn empty_operations_rejected() {
        let keypair = Keypair::generate();
        let mut tx = Transaction::new(keypair.address(), 0, 0, vec![]);
        tx.sign(&keypair).unwrap();
        assert!(matches!(tx.verify(), Err(ValidationError::BadOperation(_))));
    }

    #[test]
    fn empty_set_value_rejected() {
        let op = Operation::Set {
            key: "k".into(),
            value: vec![],
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn oversize_key_rejected() {
        let op = Operation::Delete {
            key: "k".repeat(MAX_KEY_LEN + 1),
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn canonical_payload_field_order_is_fixed() {
        let tx = Transaction::new(Address::GENESIS, 42, 7, vec![set_op("a", "b")]);
        let payload = tx.signing_payload();
        assert!(payload.starts_with("{\"from\":\"0x0000"));
        assert!(payload.contains("\"timestamp\":42"));
        assert!(payload.ends_with("\"nonce\":7}"));
    }

    #[test]
    fn canonical_string_escaping() {
        let mut out = String::new();
        escape_json_string("a\"b\\c\nd", &mut out);
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\"");
    }

    #[test]
    fn merkle_of_empty_list_is_zero() {
        assert_eq!(merkle_from_hashes(vec![]), Hash::ZERO);
    }

    #[test]
    fn merkle_single_leaf_is_identity() {
        let leaf = sha256(b"leaf");
        assert_eq!(merkle_from_hashes(vec![leaf]), leaf);
    }

    #[test]
    fn merkle_odd_count_duplicates_last() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");

        let mut ab = Vec::new();
        ab.extend_from_slice(&a.0);
        ab.extend_from_slice(&b.0);
        let mut cc = Vec::new();
        cc.extend_from_slice(&c.0);
        cc.extend_from_slice(&c.0);
        let mut root = Vec::new();
        root.extend_from_slice(&sha256(&ab).0);
        root.extend_from_slice(&sha256(&cc).0);

        assert_eq!(merkle_from_hashes(vec![a, b, c]), sha256(&root));
    }

    #[test]
    fn block_hash_covers_header_only() {
        let header = BlockHeader {
            version: 1,
            height: 1,
            previous_hash: sha256(b"parent"),
            timestamp: 100,
            merkle_root: Hash::ZERO,
            state_root: Hash::ZERO,
            producer_addr: Address::GENESIS,
            nonce: 0,
        };
        let mut block = Block {
            header,
            transactions: vec![],
            signature: Signature::empty(),
        };
        let before = block.hash();
        block
            .transactions
            .push(Transaction::genesis(0, vec![set_op("k", "v")]));
        assert_eq!(block.hash(), before);
    }

    #[test]
    fn block_wire_round_trip() {
        let keypair = Keypair::generate();
        let mut tx = Transaction::new(keypair.address(), 5, 0, vec![set_op("k", "v")]);
        tx.sign(&keypair).unwrap();
        let block = Block {
            header: BlockHeader {
                version: 2,
                height: 3,
                previous_hash: sha256(b"prev"),
                timestamp: 9,
                merkle_root: merkle_root(std::slice::from_ref(&tx)),
                state_root: sha256(b"state"),
                producer_addr: keypair.address(),
                nonce: 0,
            },
            transactions: vec![tx],
            signature: Signature::empty(),
        };
        let encoded = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(
            decoded.transactions[0].compute_id(),
            block.transactions[0].compute_id()
        );
    }
}
