use crate::crypto::Hash;
use crate::types::{Address, Transaction, ValidationError};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

pub const MAX_POOL_TXS: usize = 10_000;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("transaction already in the pool")]
    Duplicate,
    #[error("pool is full")]
    Full,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Default)]
struct PoolInner {
    by_id: HashMap<Hash, Transaction>,
    // sender -> nonce -> ids; several pending transactions may carry the
    // same nonce, only one of them can ever commit
    by_sender: HashMap<Address, BTreeMap<u64, Vec<Hash>>>,
}

/// Pending transactions awaiting inclusion. Admission re-validates the
/// transaction; ordering handed to the producer is deterministic (sorted by
/// id) so a producer's merkle root always matches its own state root run.
pub struct TxPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TxPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOL_TXS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        TxPool {
            inner: RwLock::new(PoolInner::default()),
            capacity,
        }
    }

    pub fn add(&self, tx: Transaction) -> Result<Hash, PoolError> {
        tx.verify()?;
        let id = tx.compute_id();
        let mut inner = self.inner.write().unwrap();
        if inner.by_id.contains_key(&id) {
            return Err(PoolError::Duplicate);
        }
        if inner.by_id.len() >= self.capacity {
            return Err(PoolError::Full);
        }
        inner
            .by_sender
            .entry(tx.from)
            .or_default()
            .entry(tx.nonce)
            .or_default()
            .push(id);
        inner.by_id.insert(id, tx);
        debug!("pool admitted {id} ({} pending)", inner.by_id.len());
        Ok(id)
    }

    pub fn remove(&self, id: &Hash) -> Option<Transaction> {
        let mut inner = self.inner.write().unwrap();
        remove_locked(&mut inner, id)
    }

    /// Evict transactions included in a committed block.
    pub fn remove_many(&self, transactions: &[Transaction]) {
        let mut inner = self.inner.write().unwrap();
        for tx in transactions {
            remove_locked(&mut inner, &tx.compute_id());
        }
    }

    /// Up to `max` pending transactions, sorted by id.
    pub fn get_pending(&self, max: usize) -> Vec<Transaction> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<&Hash> = inner.by_id.keys().collect();
        ids.sort();
        ids.into_iter()
            .take(max)
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Pending transactions from one sender, in nonce order.
    pub fn get_by_address(&self, addr: &Address) -> Vec<Transaction> {
        let inner = self.inner.read().unwrap();
        let Some(nonces) = inner.by_sender.get(addr) else {
            return Vec::new();
        };
        nonces
            .values()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.inner.read().unwrap().by_id.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.by_id.clear();
        inner.by_sender.clear();
    }
}

fn remove_locked(inner: &mut PoolInner, id: &Hash) -> Option<Transaction> {
    let tx = inner.by_id.remove(id)?;
    if let Some(nonces) = inner.by_sender.get_mut(&tx.from) {
        if let Some(ids) = nonces.get_mut(&tx.nonce) {
            ids.retain(|candidate| candidate != id);
            if ids.is_empty() {
                nonces.remove(&tx.nonce);
            }
        }
        if nonces.is_empty() {
            inner.by_sender.remove(&tx.from);
        }
    }
    Some(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::types::Operation;

    fn signed_tx(sender: &Keypair, nonce: u64, value: &str) -> Transaction {
        let mut tx = Transaction::new(
            sender.address(),
            100,
            nonce,
            vec![Operation::Set {
                key: "k".into(),
                value: value.as_bytes().to_vec(),
            }],
        );
        tx.sign(sender).unwrap();
        tx
    }

    #[test]
    fn duplicate_rejected_by_id() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        let tx = signed_tx(&sender, 0, "v");
        pool.add(tx.clone()).unwrap();
        assert!(matches!(pool.add(tx), Err(PoolError::Duplicate)));
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn same_nonce_different_payload_both_admitted() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        pool.add(signed_tx(&sender, 0, "first")).unwrap();
        pool.add(signed_tx(&sender, 0, "second")).unwrap();
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.get_by_address(&sender.address()).len(), 2);
    }

    #[test]
    fn capacity_enforced() {
        let sender = Keypair::generate();
        let pool = TxPool::with_capacity(2);
        pool.add(signed_tx(&sender, 0, "a")).unwrap();
        pool.add(signed_tx(&sender, 1, "b")).unwrap();
        assert!(matches!(
            pool.add(signed_tx(&sender, 2, "c")),
            Err(PoolError::Full)
        ));
    }

    #[test]
    fn invalid_transaction_rejected() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        let mut tx = signed_tx(&sender, 0, "v");
        tx.signature = crate::crypto::Signature::empty();
        assert!(matches!(pool.add(tx), Err(PoolError::Invalid(_))));
    }

    #[test]
    fn pending_order_is_deterministic() {
        let sender = Keypair::generate();
        let pool_a = TxPool::new();
        let pool_b = TxPool::new();
        let txs: Vec<Transaction> = (0..5).map(|n| signed_tx(&sender, n, "v")).collect();
        for tx in &txs {
            pool_a.add(tx.clone()).unwrap();
        }
        for tx in txs.iter().rev() {
            pool_b.add(tx.clone()).unwrap();
        }
        let ids_a: Vec<Hash> = pool_a.get_pending(10).iter().map(|t| t.compute_id()).collect();
        let ids_b: Vec<Hash> = pool_b.get_pending(10).iter().map(|t| t.compute_id()).collect();
        assert_eq!(ids_a, ids_b);
        assert!(ids_a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn get_pending_respects_max() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        for n in 0..5 {
            pool.add(signed_tx(&sender, n, "v")).unwrap();
        }
        assert_eq!(pool.get_pending(3).len(), 3);
    }

    #[test]
    fn remove_many_cleans_both_indexes() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        let txs: Vec<Transaction> = (0..3).map(|n| signed_tx(&sender, n, "v")).collect();
        for tx in &txs {
            pool.add(tx.clone()).unwrap();
        }
        pool.remove_many(&txs[..2]);
        assert_eq!(pool.count(), 1);
        let remaining = pool.get_by_address(&sender.address());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].nonce, 2);
    }

    #[test]
    fn by_address_is_nonce_ordered() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        for nonce in [3u64, 0, 2, 1] {
            pool.add(signed_tx(&sender, nonce, "v")).unwrap();
        }
        let nonces: Vec<u64> = pool
            .get_by_address(&sender.address())
            .iter()
            .map(|t| t.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }

    #[test]
    fn clear_empties_pool() {
        let sender = Keypair::generate();
        let pool = TxPool::new();
        pool.add(signed_tx(&sender, 0, "v")).unwrap();
        pool.clear();
        assert_eq!(pool.count(), 0);
        assert!(pool.get_by_address(&sender.address()).is_empty());
    }
}
