use crate::crypto::{Hash, sha256};
use crate::types::{Address, Operation, ValidationError, merkle_from_hashes};
use num_bigint::BigUint;
use std::collections::BTreeMap;

/// State key holding an address balance.
pub fn balance_key(addr: &Address) -> String {
    format!("balance:{}", addr.to_hex())
}

/// Big-endian magnitude bytes; zero encodes as empty.
pub fn encode_amount(amount: &BigUint) -> Vec<u8> {
    if amount == &BigUint::default() {
        Vec::new()
    } else {
        amount.to_bytes_be()
    }
}

pub fn decode_amount(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// A storage-visible mutation: `None` value means the key was deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateWrite {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// The in-memory current state. Kept in an ordered map so the state root
/// never depends on insertion order. Cloning yields an independent snapshot
/// for speculative execution; snapshots never touch storage.
#[derive(Clone, Debug, Default)]
pub struct State {
    entries: BTreeMap<String, Vec<u8>>,
}

impl State {
    pub fn new() -> Self {
        State::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        State {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    pub fn set(&mut self, key: String, value: Vec<u8>) -> StateWrite {
        self.entries.insert(key.clone(), value.clone());
        StateWrite {
            key,
            value: Some(value),
        }
    }

    pub fn delete(&mut self, key: &str) -> StateWrite {
        self.entries.remove(key);
        StateWrite {
            key: key.to_string(),
            value: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.entries.iter()
    }

    pub fn balance_of(&self, key: &str) -> BigUint {
        self.get(key).map(decode_amount).unwrap_or_default()
    }

    pub fn credit(&mut self, key: &str, amount: &BigUint) -> StateWrite {
        let updated = self.balance_of(key) + amount;
        self.set(key.to_string(), encode_amount(&updated))
    }

    pub fn debit(&mut self, key: &str, amount: &BigUint) -> Result<StateWrite, ValidationError> {
        let current = self.balance_of(key);
        if &current < amount {
            return Err(ValidationError::InsufficientBalance(key.to_string()));
        }
        let updated = current - amount;
        Ok(self.set(key.to_string(), encode_amount(&updated)))
    }

    /// Apply one operation on behalf of `sender`. Returns the writes to
    /// persist; callers running speculatively discard them.
    pub fn apply_operation(
        &mut self,
        sender: &Address,
        op: &Operation,
        allow_mint: bool,
    ) -> Result<Vec<StateWrite>, ValidationError> {
        op.validate()?;
        match op {
            Operation::Set { key, value } => Ok(vec![self.set(key.clone(), value.clone())]),
            Operation::Delete { key } => Ok(vec![self.delete(key)]),
            Operation::Mint { key, amount } => {
                if !allow_mint {
                    return Err(ValidationError::UnauthorizedMint(*sender));
                }
                Ok(vec![self.credit(key, &decode_amount(amount))])
            }
            Operation::Transfer { key, amount } => {
                let amount = decode_amount(amount);
                let debit = self.debit(&balance_key(sender), &amount)?;
                let credit = self.credit(key, &amount);
                Ok(vec![debit, credit])
            }
        }
    }

    /// Merkle root over the sorted entries: each leaf is
    /// `SHA-256(key_bytes || value_bytes)`. Empty state is all zeros.
    pub fn root(&self) -> Hash {
        let leaves = self
            .entries
            .iter()
            .map(|(key, value)| {
                let mut data = Vec::with_capacity(key.len() + value.len());
                data.extend_from_slice(key.as_bytes());
                data.extend_from_slice(value);
                sha256(&data)
            })
            .collect();
        merkle_from_hashes(leaves)
    }
}
