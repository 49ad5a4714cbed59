use crate::crypto::Hash;
use crate::types::{Block, Transaction};
use rocksdb::{DB, Direction, IteratorMode, Options};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    Backend(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

pub const BLOCK_PREFIX: &str = "blk:";
pub const HEIGHT_INDEX_PREFIX: &str = "blh:";
pub const TX_PREFIX: &str = "tx:";
pub const STATE_PREFIX: &str = "st:";
pub const META_HEIGHT_KEY: &[u8] = b"meta:height";

pub fn block_key(hash: &Hash) -> Vec<u8> {
    format!("{BLOCK_PREFIX}{}", hash.to_hex()).into_bytes()
}

/// Zero-padded so lexicographic key order equals height order.
pub fn height_key(height: u64) -> Vec<u8> {
    format!("{HEIGHT_INDEX_PREFIX}{height:020}").into_bytes()
}

pub fn tx_key(hash: &Hash) -> Vec<u8> {
    format!("{TX_PREFIX}{}", hash.to_hex()).into_bytes()
}

pub fn state_key(key: &str) -> Vec<u8> {
    format!("{STATE_PREFIX}{key}").into_bytes()
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A batch of writes committed atomically. Block commits put the block, its
/// transactions, the touched state entries and the height marker through a
/// single batch so a crash never leaves a partial block behind.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn put_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let hash = block.hash();
        let encoded = serde_json::to_vec(block)?;
        self.ops.push(WriteOp::Put {
            key: block_key(&hash),
            value: encoded,
        });
        self.ops.push(WriteOp::Put {
            key: height_key(block.header.height),
            value: hash.0.to_vec(),
        });
        Ok(())
    }

    pub fn put_transaction(&mut self, tx: &Transaction) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(tx)?;
        self.ops.push(WriteOp::Put {
            key: tx_key(&tx.compute_id()),
            value: encoded,
        });
        Ok(())
    }

    pub fn put_state(&mut self, key: &str, value: &[u8]) {
        self.ops.push(WriteOp::Put {
            key: state_key(key),
            value: value.to_vec(),
        });
    }

    pub fn delete_state(&mut self, key: &str) {
        self.ops.push(WriteOp::Delete {
            key: state_key(key),
        });
    }

    pub fn set_height(&mut self, height: u64) {
        self.ops.push(WriteOp::Put {
            key: META_HEIGHT_KEY.to_vec(),
            value: height.to_string().into_bytes(),
        });
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Ordered key-value store behind the chain engine. Backends supply the raw
/// primitives; the typed surface is shared.
pub trait Storage: Send + Sync {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
    /// Entries whose key starts with `prefix`, in key order. `limit == 0`
    /// means unbounded.
    fn scan_raw(&self, prefix: &[u8], limit: usize)
    -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put_block(block)?;
        self.commit(batch)
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.get_raw(&block_key(hash))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        let Some(raw) = self.get_raw(&height_key(height))? else {
            return Ok(None);
        };
        if raw.len() != 32 {
            return Err(StorageError::Corrupt(format!(
                "height index for {height} holds {} bytes",
                raw.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&raw);
        let block = self.get_block_by_hash(&Hash(hash))?;
        if block.is_none() {
            return Err(StorageError::Corrupt(format!(
                "height index for {height} points at a missing block"
            )));
        }
        Ok(block)
    }

    fn save_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put_transaction(tx)?;
        self.commit(batch)
    }

    fn get_transaction(&self, hash: &Hash) -> Result<Option<Transaction>, StorageError> {
        match self.get_raw(&tx_key(hash))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put_state(key, value);
        self.commit(batch)
    }

    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_raw(&state_key(key))
    }

    fn delete_state(&self, key: &str) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete_state(key);
        self.commit(batch)
    }

    fn save_height(&self, height: u64) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.set_height(height);
        self.commit(batch)
    }

    fn get_height(&self) -> Result<Option<u64>, StorageError> {
        let Some(raw) = self.get_raw(META_HEIGHT_KEY)? else {
            return Ok(None);
        };
        let text = String::from_utf8(raw)
            .map_err(|_| StorageError::Corrupt("height marker is not UTF-8".into()))?;
        let height = text
            .trim()
            .parse::<u64>()
            .map_err(|_| StorageError::Corrupt(format!("height marker {text:?}")))?;
        Ok(Some(height))
    }

    /// State entries under `st:<prefix>`, with the namespace stripped.
    fn scan_state_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let raw_prefix = state_key(prefix);
        let mut out = Vec::new();
        for (key, value) in self.scan_raw(&raw_prefix, limit)? {
            let text = String::from_utf8(key)
                .map_err(|_| StorageError::Corrupt("state key is not UTF-8".into()))?;
            let stripped = text
                .strip_prefix(STATE_PREFIX)
                .ok_or_else(|| StorageError::Corrupt(format!("state key {text:?}")))?;
            out.push((stripped.to_string(), value));
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// In-memory storage for tests and ephemeral nodes
// -----------------------------------------------------------------------------
#[derive(Clone, Default)]
pub struct MemStorage {
    entries: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_raw(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let entries = self.entries.lock().unwrap();
        let mut out = Vec::new();
        for (key, value) in entries.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.clone(), value.clone()));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// RocksDB storage
// -----------------------------------------------------------------------------
pub struct RocksStorage {
    db: DB,
}

impl RocksStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Storage for RocksStorage {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => rocks_batch.put(key, value),
                WriteOp::Delete { key } => rocks_batch.delete(key),
            }
        }
        self.db.write(rocks_batch)?;
        Ok(())
    }

    fn scan_raw(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
