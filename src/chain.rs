use crate::crypto::Hash;
use crate::genesis::{GasConfig, GenesisConfig};
use crate::state::{State, StateWrite, balance_key};
use crate::storage::{Storage, StorageError, WriteBatch};
use crate::types::{
    Address, Block, MAX_BLOCK_SIZE, MAX_BLOCK_TXS, MAX_TIMESTAMP_DRIFT_SECS, Transaction,
    ValidationError, merkle_root, unix_now,
};
use log::{info, warn};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain already initialized")]
    AlreadyInitialized,
    #[error("chain not initialized")]
    NotInitialized,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainInfo {
    pub height: u64,
    pub tip_hash: Hash,
    pub version: u32,
    pub network_id: Hash,
    pub authorities: Vec<Address>,
    pub gas_enabled: bool,
}

/// Outcome of producer-side assembly.
pub struct BlockPlan {
    pub transactions: Vec<Transaction>,
    pub rejected: Vec<(Transaction, ValidationError)>,
    pub state_root: Hash,
}

struct ChainInner {
    tip: Option<Block>,
    state: State,
    nonces: HashMap<Address, u64>,
}

/// The chain engine. Exclusively owns the state map, the per-sender nonce
/// map and the storage handle; a single reader/writer lock makes every
/// commit appear atomic to readers.
pub struct Chain {
    storage: Arc<dyn Storage>,
    authorities: Vec<Address>,
    gas: Option<GasConfig>,
    version: u32,
    network_id: Hash,
    inner: RwLock<ChainInner>,
}

impl Chain {
    pub fn new(storage: Arc<dyn Storage>, genesis: &GenesisConfig, network_id: Hash) -> Self {
        Chain {
            storage,
            authorities: genesis.authorities.clone(),
            gas: genesis.gas_config.clone(),
            version: genesis.header_version(),
            network_id,
            inner: RwLock::new(ChainInner {
                tip: None,
                state: State::new(),
                nonces: HashMap::new(),
            }),
        }
    }

    /// Validate and persist the genesis block. The header's state root is
    /// overwritten with the root of the applied initial state; the finalized
    /// block is returned.
    pub fn initialize(&self, genesis_block: &Block) -> Result<Block, ChainError> {
        let mut inner = self.inner.write().unwrap();
        if self.storage.get_height()?.is_some() {
            return Err(ChainError::AlreadyInitialized);
        }
        if genesis_block.header.height != 0 {
            return Err(ValidationError::BadHeight {
                expected: 0,
                got: genesis_block.header.height,
            }
            .into());
        }
        if !genesis_block.header.previous_hash.is_zero() {
            return Err(ValidationError::BadPreviousHash.into());
        }
        if !genesis_block.signature.is_empty() {
            return Err(ValidationError::BadSignature("genesis block must be unsigned".into()).into());
        }
        if merkle_root(&genesis_block.transactions) != genesis_block.header.merkle_root {
            return Err(ValidationError::BadMerkleRoot.into());
        }
        for tx in &genesis_block.transactions {
            if !tx.is_genesis() {
                return Err(ValidationError::BadSignature(
                    "genesis transactions must be unsigned and from the genesis address".into(),
                )
                .into());
            }
            if tx.data.operations.is_empty() {
                return Err(ValidationError::BadOperation("empty operation list".into()).into());
            }
        }

        let mut state = State::new();
        let mut nonces = HashMap::new();
        let mut writes = Vec::new();
        self.execute_transactions(
            &mut state,
            &mut nonces,
            &genesis_block.transactions,
            &Address::GENESIS,
            &mut writes,
        )?;

        let mut block = genesis_block.clone();
        block.header.state_root = state.root();

        let mut batch = WriteBatch::new();
        push_state_writes(&mut batch, &writes);
        batch.put_block(&block)?;
        for tx in &block.transactions {
            batch.put_transaction(tx)?;
        }
        batch.set_height(0);
        self.storage.commit(batch)?;

        info!(
            "initialized chain at genesis {} (network {})",
            block.hash(),
            self.network_id
        );
        inner.tip = Some(block.clone());
        inner.state = state;
        inner.nonces = nonces;
        Ok(block)
    }

    /// Rebuild the in-memory state and nonce map by replaying every stored
    /// block from genesis to the tip.
    pub fn load_from_storage(&self) -> Result<(), ChainError> {
        let mut inner = self.inner.write().unwrap();
        let height = self.storage.get_height()?.ok_or(ChainError::NotInitialized)?;

        let mut state = State::new();
        let mut nonces = HashMap::new();
        let mut tip = None;
        for h in 0..=height {
            let block = self.storage.get_block_by_height(h)?.ok_or_else(|| {
                StorageError::Corrupt(format!("missing block at height {h}"))
            })?;
            let mut discard = Vec::new();
            self.execute_transactions(
                &mut state,
                &mut nonces,
                &block.transactions,
                &block.header.producer_addr,
                &mut discard,
            )?;
            tip = Some(block);
        }
        if let Some(block) = &tip {
            if state.root() != block.header.state_root {
                return Err(StorageError::Corrupt(
                    "replayed state does not match the stored tip".into(),
                )
                .into());
            }
            info!(
                "loaded chain at height {} tip {}",
                block.header.height,
                block.hash()
            );
        }
        inner.tip = tip;
        inner.state = state;
        inner.nonces = nonces;
        Ok(())
    }

    /// Validate and commit the next block. The whole commit happens under
    /// the writer lock; on any failure the tip, state and storage are left
    /// untouched.
    pub fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        if block.is_genesis() {
            return Err(ChainError::AlreadyInitialized);
        }
        let mut inner = self.inner.write().unwrap();
        let tip = inner.tip.clone().ok_or(ChainError::NotInitialized)?;
        self.validate_block(block, &tip)?;

        // Execute against a snapshot first; the live maps are only replaced
        // once the state root matches and the batch is durably committed.
        let mut state = inner.state.clone();
        let mut nonces = inner.nonces.clone();
        let mut writes = Vec::new();
        self.execute_transactions(
            &mut state,
            &mut nonces,
            &block.transactions,
            &block.header.producer_addr,
            &mut writes,
        )?;
        if state.root() != block.header.state_root {
            warn!(
                "state root mismatch at height {}: block {}",
                block.header.height,
                block.hash()
            );
            return Err(ValidationError::BadStateRoot.into());
        }

        let mut batch = WriteBatch::new();
        push_state_writes(&mut batch, &writes);
        batch.put_block(block)?;
        for tx in &block.transactions {
            batch.put_transaction(tx)?;
        }
        batch.set_height(block.header.height);
        self.storage.commit(batch)?;

        info!(
            "committed block {} at height {} with {} tx(s)",
            block.hash(),
            block.header.height,
            block.transactions.len()
        );
        inner.state = state;
        inner.nonces = nonces;
        inner.tip = Some(block.clone());
        Ok(())
    }

    /// The state root a block with these transactions would commit to.
    /// Runs on a clone; nothing is persisted.
    pub fn calculate_state_root_with(
        &self,
        transactions: &[Transaction],
        producer: &Address,
    ) -> Result<Hash, ChainError> {
        let inner = self.inner.read().unwrap();
        let mut state = inner.state.clone();
        let mut nonces = inner.nonces.clone();
        let mut discard = Vec::new();
        self.execute_transactions(&mut state, &mut nonces, transactions, producer, &mut discard)?;
        Ok(state.root())
    }

    fn validate_block(&self, block: &Block, tip: &Block) -> Result<(), ValidationError> {
        let size = block.byte_size();
        if size > MAX_BLOCK_SIZE {
            return Err(ValidationError::OversizeBlock(size));
        }
        if block.transactions.len() > MAX_BLOCK_TXS {
            return Err(ValidationError::TooManyTransactions(
                block.transactions.len(),
            ));
        }
        if block.header.version != self.version {
            return Err(ValidationError::BadVersion {
                expected: self.version,
                got: block.header.version,
            });
        }
        let expected_height = tip.header.height + 1;
        if block.header.height != expected_height {
            return Err(ValidationError::BadHeight {
                expected: expected_height,
                got: block.header.height,
            });
        }
        if block.header.previous_hash != tip.hash() {
            return Err(ValidationError::BadPreviousHash);
        }
        if block.header.timestamp <= tip.header.timestamp {
            return Err(ValidationError::BadTimestamp(format!(
                "{} is not after parent {}",
                block.header.timestamp, tip.header.timestamp
            )));
        }
        let now = unix_now();
        if block.header.timestamp > now + MAX_TIMESTAMP_DRIFT_SECS {
            return Err(ValidationError::BadTimestamp(format!(
                "{} is too far in the future (now {now})",
                block.header.timestamp
            )));
        }
        let slot_producer = self.slot_authority(block.header.height);
        if block.header.producer_addr != slot_producer {
            return Err(ValidationError::NotAuthority(block.header.producer_addr));
        }
        let signer = block.recover_producer()?;
        if signer != block.header.producer_addr {
            return Err(ValidationError::BadSignature(format!(
                "recovered {signer}, expected producer {}",
                block.header.producer_addr
            )));
        }
        if merkle_root(&block.transactions) != block.header.merkle_root {
            return Err(ValidationError::BadMerkleRoot);
        }
        for tx in &block.transactions {
            tx.verify()?;
        }
        Ok(())
    }

    /// Apply one transaction: nonce check, fee debit, operations, nonce
    /// advance. Returns the fee taken; writes are recorded for the commit
    /// batch.
    fn execute_one(
        &self,
        state: &mut State,
        nonces: &mut HashMap<Address, u64>,
        tx: &Transaction,
        writes: &mut Vec<StateWrite>,
    ) -> Result<BigUint, ValidationError> {
        let genesis_tx = tx.is_genesis();
        if !genesis_tx {
            let expected = nonces.get(&tx.from).copied().unwrap_or(0);
            if tx.nonce != expected {
                return Err(ValidationError::BadNonce {
                    expected,
                    got: tx.nonce,
                });
            }
        }
        let mut fee = BigUint::default();
        if let Some(gas) = &self.gas {
            if !genesis_tx {
                fee = gas.fee_for(tx.byte_size());
                if fee > BigUint::default() {
                    writes.push(state.debit(&balance_key(&tx.from), &fee)?);
                }
            }
        }
        let allow_mint = genesis_tx || self.is_authority(&tx.from);
        for op in &tx.data.operations {
            writes.extend(state.apply_operation(&tx.from, op, allow_mint)?);
        }
        if !genesis_tx {
            *nonces.entry(tx.from).or_insert(0) += 1;
        }
        Ok(fee)
    }

    /// Apply transactions strictly in order; accumulated fees are credited
    /// to the producer at the end.
    fn execute_transactions(
        &self,
        state: &mut State,
        nonces: &mut HashMap<Address, u64>,
        transactions: &[Transaction],
        producer: &Address,
        writes: &mut Vec<StateWrite>,
    ) -> Result<(), ValidationError> {
        let mut fee_pot = BigUint::default();
        for tx in transactions {
            fee_pot += self.execute_one(state, nonces, tx, writes)?;
        }
        if fee_pot > BigUint::default() && !producer.is_genesis() {
            writes.push(state.credit(&balance_key(producer), &fee_pot));
        }
        Ok(())
    }

    /// Producer-side assembly: try each candidate against a snapshot and
    /// keep the ones that execute, so one bad pooled transaction cannot
    /// block production. Returns the kept list, the rejects with their
    /// reasons, and the post-execution state root for the header.
    pub fn plan_block(
        &self,
        candidates: &[Transaction],
        producer: &Address,
    ) -> Result<BlockPlan, ChainError> {
        let inner = self.inner.read().unwrap();
        let mut state = inner.state.clone();
        let mut nonces = inner.nonces.clone();
        drop(inner);

        let mut kept = Vec::new();
        let mut rejected = Vec::new();
        let mut fee_pot = BigUint::default();
        for tx in candidates {
            let mut trial_state = state.clone();
            let mut trial_nonces = nonces.clone();
            let mut discard = Vec::new();
            match self.execute_one(&mut trial_state, &mut trial_nonces, tx, &mut discard) {
                Ok(fee) => {
                    state = trial_state;
                    nonces = trial_nonces;
                    fee_pot += fee;
                    kept.push(tx.clone());
                }
                Err(reason) => rejected.push((tx.clone(), reason)),
            }
        }
        if fee_pot > BigUint::default() && !producer.is_genesis() {
            state.credit(&balance_key(producer), &fee_pot);
        }
        Ok(BlockPlan {
            transactions: kept,
            rejected,
            state_root: state.root(),
        })
    }

    fn slot_authority(&self, height: u64) -> Address {
        self.authorities[(height % self.authorities.len() as u64) as usize]
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_height(&self) -> Result<u64, ChainError> {
        let inner = self.inner.read().unwrap();
        inner
            .tip
            .as_ref()
            .map(|b| b.header.height)
            .ok_or(ChainError::NotInitialized)
    }

    pub fn get_tip(&self) -> Option<Block> {
        self.inner.read().unwrap().tip.clone()
    }

    pub fn get_state(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .unwrap()
            .state
            .get(key)
            .map(|v| v.to_vec())
    }

    pub fn get_balance(&self, addr: &Address) -> BigUint {
        self.inner
            .read()
            .unwrap()
            .state
            .balance_of(&balance_key(addr))
    }

    pub fn get_nonce(&self, addr: &Address) -> u64 {
        self.inner
            .read()
            .unwrap()
            .nonces
            .get(addr)
            .copied()
            .unwrap_or(0)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        Ok(self.storage.get_block_by_height(height)?)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        Ok(self.storage.get_block_by_hash(hash)?)
    }

    pub fn get_transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        Ok(self.storage.get_transaction(hash)?)
    }

    pub fn query_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, ChainError> {
        Ok(self.storage.scan_state_prefix(prefix, limit)?)
    }

    pub fn get_authorities(&self) -> &[Address] {
        &self.authorities
    }

    pub fn is_authority(&self, addr: &Address) -> bool {
        self.authorities.contains(addr)
    }

    pub fn gas_config(&self) -> Option<&GasConfig> {
        self.gas.as_ref()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn network_id(&self) -> Hash {
        self.network_id
    }

    pub fn get_chain_info(&self) -> Result<ChainInfo, ChainError> {
        let inner = self.inner.read().unwrap();
        let tip = inner.tip.as_ref().ok_or(ChainError::NotInitialized)?;
        Ok(ChainInfo {
            height: tip.header.height,
            tip_hash: tip.hash(),
            version: self.version,
            network_id: self.network_id,
            authorities: self.authorities.clone(),
            gas_enabled: self.gas.is_some(),
        })
    }
}

fn push_state_writes(batch: &mut WriteBatch, writes: &[StateWrite]) {
    for write in writes {
        match &write.value {
            Some(value) => batch.put_state(&write.key, value),
            None => batch.delete_state(&write.key),
        }
    }
}
