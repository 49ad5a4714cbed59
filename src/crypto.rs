use crate::types::Address;
use alloy_primitives::keccak256;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidKey,
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature recovery failed")]
    Recovery,
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// A 32-byte SHA-256 digest. Hex-encoded (no prefix) in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::MalformedSignature(format!("bad hash hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(CryptoError::MalformedSignature(format!(
                "hash must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A recoverable secp256k1 signature, 65 bytes (r || s || v).
/// Empty for genesis blocks and genesis transactions.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Signature(bytes))
    }
}

pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// Derive the 20-byte address from a public key: Keccak-256 over the
/// uncompressed point (without the 0x04 tag), last 20 bytes.
pub fn address_from_key(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address::new(out)
}

/// A secp256k1 keypair used by producer nodes to sign blocks and by clients
/// to sign transactions.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair {
            secret: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Keypair { secret })
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    /// Load a key from a file holding the hex-encoded 32-byte secret.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_hex(&contents)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn address(&self) -> Address {
        address_from_key(self.secret.verifying_key())
    }

    /// Sign a precomputed digest, producing the 65-byte recoverable form.
    pub fn sign(&self, digest: &Hash) -> Result<Signature, CryptoError> {
        let (sig, recovery_id) = self
            .secret
            .sign_prehash_recoverable(&digest.0)
            .map_err(|_| CryptoError::InvalidKey)?;
        let mut bytes = sig.to_vec();
        bytes.push(recovery_id.to_byte());
        Ok(Signature(bytes))
    }
}

/// Recover the signer address from a digest and a 65-byte signature.
pub fn recover_address(digest: &Hash, signature: &Signature) -> Result<Address, CryptoError> {
    if signature.0.len() != 65 {
        return Err(CryptoError::MalformedSignature(format!(
            "expected 65 bytes, got {}",
            signature.0.len()
        )));
    }
    let sig = EcdsaSignature::from_slice(&signature.0[..64])
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature.0[64]).ok_or_else(|| {
        CryptoError::MalformedSignature(format!("bad recovery id {}", signature.0[64]))
    })?;
    let key = VerifyingKey::recover_from_prehash(&digest.0, &sig, recovery_id)
        .map_err(|_| CryptoError::Recovery)?;
    Ok(address_from_key(&key))
}
