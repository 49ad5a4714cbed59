use crate::chain::{Chain, ChainError};
use crate::config::{ConfigError, NodeConfig, NodeType};
use crate::consensus::Poa;
use crate::crypto::{CryptoError, Hash, Keypair, Signature};
use crate::genesis::GenesisConfig;
use crate::p2p::{
    BlocksPayload, GetBlockByHashPayload, GetBlockByHeightPayload, GetBlocksPayload,
    GetStatePayload, HeightPayload, Message, MessageType, NetworkError, NewBlockPayload,
    NewTransactionPayload, P2pServer, PeersPayload,
};
use crate::storage::{Storage, StorageError};
use crate::sync::{SYNC_BATCH_BLOCKS, Syncer};
use crate::tx_pool::{PoolError, TxPool};
use crate::types::{
    Block, BlockHeader, MAX_BLOCK_TXS, Transaction, ValidationError, merkle_root, unix_now,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub const AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
}

/// Event delivery to external consumers (WebSocket fanout, metrics, logs).
/// Invoked on block commit and on mempool admission.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_new_block(&self, block: &Block);
    async fn on_new_transaction(&self, tx: &Transaction, status: TxStatus);
}

pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn on_new_block(&self, _block: &Block) {}
    async fn on_new_transaction(&self, _tx: &Transaction, _status: TxStatus) {}
}

/// The node orchestrator: owns every subsystem, wires gossip handlers, and
/// drives the producer and auto-sync tickers.
pub struct Node {
    config: NodeConfig,
    genesis: GenesisConfig,
    keypair: Option<Keypair>,
    poa: Poa,
    chain: Arc<Chain>,
    pool: Arc<TxPool>,
    p2p: Arc<P2pServer>,
    syncer: Arc<Syncer>,
    events: Arc<dyn EventSink>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        genesis: GenesisConfig,
        network_id: Hash,
        storage: Arc<dyn Storage>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        genesis.validate()?;

        let keypair = match (&config.node_type, &config.private_key) {
            (NodeType::Producer, Some(path)) => {
                let keypair = Keypair::from_file(path)?;
                match config.address {
                    Some(expected) if expected == keypair.address() => Some(keypair),
                    Some(expected) => {
                        return Err(ConfigError::BadAddress(format!(
                            "key resolves to {}, config says {expected}",
                            keypair.address()
                        ))
                        .into());
                    }
                    None => return Err(ConfigError::MissingField("address").into()),
                }
            }
            _ => None,
        };

        let poa = Poa::new(genesis.authorities.clone(), config.block_time());
        let chain = Arc::new(Chain::new(storage, &genesis, network_id));
        let pool = Arc::new(TxPool::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let p2p = Arc::new(P2pServer::new(
            config.p2p_listen_addr(),
            config.max_peers,
            shutdown_rx,
        ));
        let syncer = Arc::new(Syncer::new(chain.clone(), pool.clone(), p2p.clone()));

        Ok(Node {
            config,
            genesis,
            keypair,
            poa,
            chain,
            pool,
            p2p,
            syncer,
            events,
            shutdown,
        })
    }

    pub fn chain(&self) -> Arc<Chain> {
        self.chain.clone()
    }

    pub fn mempool(&self) -> Arc<TxPool> {
        self.pool.clone()
    }

    pub fn p2p(&self) -> Arc<P2pServer> {
        self.p2p.clone()
    }

    pub async fn get_peers(&self) -> Vec<String> {
        self.p2p.peer_ids().await
    }

    pub fn get_mempool(&self, max: usize) -> Vec<Transaction> {
        self.pool.get_pending(max)
    }

    /// Initialize or reload the chain, start networking, run an initial
    /// sync round, then spawn the producer and auto-sync tickers.
    pub async fn start(&self) -> Result<(), NodeError> {
        match self.chain.load_from_storage() {
            Ok(()) => {}
            Err(ChainError::NotInitialized) => {
                let genesis_block = self.genesis.build_block()?;
                self.chain.initialize(&genesis_block)?;
            }
            Err(e) => return Err(e.into()),
        }

        self.register_handlers();
        self.p2p.start().await?;
        self.p2p.bootstrap(&self.config.bootstrap_peers).await;

        if let Err(e) = self.syncer.sync().await {
            warn!("initial sync failed: {e}");
        }

        if self.config.node_type == NodeType::Producer {
            if let Some(keypair) = self.keypair.clone() {
                self.spawn_producer(keypair);
            }
        }
        self.spawn_auto_sync();
        info!(
            "node up at height {} (network {})",
            self.chain.get_height()?,
            self.chain.network_id()
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// External submission path: validate and admit, then gossip.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash, NodeError> {
        let id = self.pool.add(tx.clone())?;
        self.events.on_new_transaction(&tx, TxStatus::Pending).await;
        let message = Message::new(
            MessageType::NewTransaction,
            NewTransactionPayload { transaction: tx },
            &self.p2p.node_id(),
        )?;
        self.p2p.broadcast(&message).await;
        Ok(id)
    }

    fn spawn_producer(&self, keypair: Keypair) {
        let chain = self.chain.clone();
        let pool = self.pool.clone();
        let poa = self.poa.clone();
        let p2p = self.p2p.clone();
        let events = self.events.clone();
        let block_time = self.config.block_time();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block_time);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) =
                            produce_once(&chain, &pool, &poa, &keypair, &p2p, events.as_ref()).await
                        {
                            warn!("block production failed: {e}");
                        }
                    }
                }
            }
            debug!("producer loop stopped");
        });
    }

    fn spawn_auto_sync(&self) {
        let syncer = self.syncer.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTO_SYNC_INTERVAL);
            ticker.tick().await; // the startup sync already ran
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let _ = syncer.sync().await;
                    }
                }
            }
            debug!("auto-sync loop stopped");
        });
    }

    fn register_handlers(&self) {
        self.register_new_block_handler();
        self.register_new_transaction_handler();
        self.register_get_blocks_handler();
        self.register_get_height_handler();
        self.register_get_peers_handler();
        self.register_get_block_by_height_handler();
        self.register_get_block_by_hash_handler();
        self.register_get_state_handler();
    }

    fn register_new_block_handler(&self) {
        let chain = self.chain.clone();
        let pool = self.pool.clone();
        let p2p = self.p2p.clone();
        let syncer = self.syncer.clone();
        let events = self.events.clone();
        self.p2p.register_handler(
            MessageType::NewBlock,
            Arc::new(move |peer_id, message| {
                let chain = chain.clone();
                let pool = pool.clone();
                let p2p = p2p.clone();
                let syncer = syncer.clone();
                let events = events.clone();
                Box::pin(async move {
                    let payload: NewBlockPayload = match message.decode_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("bad NewBlock payload from {peer_id}: {e}");
                            return None;
                        }
                    };
                    let block = payload.block;
                    let current = chain.get_height().ok()?;
                    if block.header.height <= current {
                        debug!(
                            "dropping stale block {} (local height {current})",
                            block.header.height
                        );
                        return None;
                    }
                    if block.header.height == current + 1 {
                        match chain.add_block(&block) {
                            Ok(()) => {
                                pool.remove_many(&block.transactions);
                                events.on_new_block(&block).await;
                                for tx in &block.transactions {
                                    events.on_new_transaction(tx, TxStatus::Confirmed).await;
                                }
                                if let Ok(relay) = Message::new(
                                    MessageType::NewBlock,
                                    NewBlockPayload { block },
                                    &p2p.node_id(),
                                ) {
                                    p2p.broadcast_except(&relay, &peer_id).await;
                                }
                            }
                            Err(e) => warn!("rejected block from {peer_id}: {e}"),
                        }
                    } else {
                        // a gap: do not reject, catch up instead
                        debug!(
                            "future block {} from {peer_id} (local {current}), syncing",
                            block.header.height
                        );
                        tokio::spawn(async move {
                            let _ = syncer.sync().await;
                        });
                    }
                    None
                })
            }),
        );
    }

    fn register_new_transaction_handler(&self) {
        let pool = self.pool.clone();
        let p2p = self.p2p.clone();
        let events = self.events.clone();
        self.p2p.register_handler(
            MessageType::NewTransaction,
            Arc::new(move |peer_id, message| {
                let pool = pool.clone();
                let p2p = p2p.clone();
                let events = events.clone();
                Box::pin(async move {
                    let payload: NewTransactionPayload = match message.decode_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("bad NewTransaction payload from {peer_id}: {e}");
                            return None;
                        }
                    };
                    let tx = payload.transaction;
                    match pool.add(tx.clone()) {
                        Ok(_) => {
                            events.on_new_transaction(&tx, TxStatus::Pending).await;
                            if let Ok(relay) = Message::new(
                                MessageType::NewTransaction,
                                NewTransactionPayload { transaction: tx },
                                &p2p.node_id(),
                            ) {
                                p2p.broadcast_except(&relay, &peer_id).await;
                            }
                        }
                        // gossip duplicates and rejects are silent
                        Err(e) => debug!("dropped gossiped transaction: {e}"),
                    }
                    None
                })
            }),
        );
    }

    fn register_get_blocks_handler(&self) {
        let chain = self.chain.clone();
        let node_id = self.p2p.node_id();
        self.p2p.register_handler(
            MessageType::GetBlocks,
            Arc::new(move |_peer_id, message| {
                let chain = chain.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    let payload: GetBlocksPayload = message.decode_payload().ok()?;
                    let current = chain.get_height().ok()?;
                    let to = payload.to.min(current);
                    let mut blocks = Vec::new();
                    let mut height = payload.from;
                    // reply with the contiguous prefix, possibly shorter
                    while height <= to && (blocks.len() as u64) < SYNC_BATCH_BLOCKS {
                        match chain.get_block_by_height(height) {
                            Ok(Some(block)) => blocks.push(block),
                            _ => break,
                        }
                        height += 1;
                    }
                    Message::new(MessageType::Blocks, BlocksPayload { blocks }, &node_id).ok()
                })
            }),
        );
    }

    fn register_get_height_handler(&self) {
        let chain = self.chain.clone();
        let node_id = self.p2p.node_id();
        self.p2p.register_handler(
            MessageType::GetHeight,
            Arc::new(move |_peer_id, _message| {
                let chain = chain.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    let height = chain.get_height().ok()?;
                    Message::new(MessageType::Height, HeightPayload { height }, &node_id).ok()
                })
            }),
        );
    }

    fn register_get_peers_handler(&self) {
        let p2p = self.p2p.clone();
        self.p2p.register_handler(
            MessageType::GetPeers,
            Arc::new(move |peer_id, _message| {
                let p2p = p2p.clone();
                Box::pin(async move {
                    let peers = p2p
                        .peer_ids()
                        .await
                        .into_iter()
                        .filter(|id| id != &peer_id)
                        .collect();
                    Message::new(MessageType::Peers, PeersPayload { peers }, &p2p.node_id()).ok()
                })
            }),
        );
    }

    fn register_get_block_by_height_handler(&self) {
        let chain = self.chain.clone();
        let node_id = self.p2p.node_id();
        self.p2p.register_handler(
            MessageType::GetBlockByHeight,
            Arc::new(move |_peer_id, message| {
                let chain = chain.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    let payload: GetBlockByHeightPayload = message.decode_payload().ok()?;
                    let blocks = chain
                        .get_block_by_height(payload.height)
                        .ok()?
                        .into_iter()
                        .collect();
                    Message::new(MessageType::Blocks, BlocksPayload { blocks }, &node_id).ok()
                })
            }),
        );
    }

    fn register_get_block_by_hash_handler(&self) {
        let chain = self.chain.clone();
        let node_id = self.p2p.node_id();
        self.p2p.register_handler(
            MessageType::GetBlockByHash,
            Arc::new(move |_peer_id, message| {
                let chain = chain.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    let payload: GetBlockByHashPayload = message.decode_payload().ok()?;
                    let blocks = chain
                        .get_block_by_hash(&payload.hash)
                        .ok()?
                        .into_iter()
                        .collect();
                    Message::new(MessageType::Blocks, BlocksPayload { blocks }, &node_id).ok()
                })
            }),
        );
    }

    fn register_get_state_handler(&self) {
        let chain = self.chain.clone();
        let node_id = self.p2p.node_id();
        self.p2p.register_handler(
            MessageType::GetState,
            Arc::new(move |_peer_id, message| {
                let chain = chain.clone();
                let node_id = node_id.clone();
                Box::pin(async move {
                    let payload: GetStatePayload = message.decode_payload().ok()?;
                    let value = chain.get_state(&payload.key).map(hex::encode);
                    Message::new(
                        MessageType::GetState,
                        GetStatePayload {
                            key: payload.key,
                            value,
                        },
                        &node_id,
                    )
                    .ok()
                })
            }),
        );
    }
}

/// One producer tick: eligibility, pacing, assembly, signing, commit,
/// gossip. The chain lock is released before any network send.
async fn produce_once(
    chain: &Chain,
    pool: &TxPool,
    poa: &Poa,
    keypair: &Keypair,
    p2p: &P2pServer,
    events: &dyn EventSink,
) -> Result<(), NodeError> {
    let Some(tip) = chain.get_tip() else {
        return Ok(());
    };
    let next_height = tip.header.height + 1;
    let my_addr = keypair.address();
    if !poa.can_produce(next_height, &my_addr) {
        return Ok(());
    }
    if !poa.should_produce(tip.header.timestamp) {
        return Ok(());
    }

    let candidates = pool.get_pending(MAX_BLOCK_TXS);
    let plan = chain.plan_block(&candidates, &my_addr)?;
    for (tx, reason) in &plan.rejected {
        match reason {
            // not yet executable, keep it pooled
            ValidationError::BadNonce { expected, got } if got > expected => {}
            _ => {
                debug!(
                    "evicting unexecutable transaction {}: {reason}",
                    tx.compute_id()
                );
                let _ = pool.remove(&tx.compute_id());
            }
        }
    }

    let transactions = plan.transactions;
    let mut block = Block {
        header: BlockHeader {
            version: chain.version(),
            height: next_height,
            previous_hash: tip.hash(),
            timestamp: unix_now().max(tip.header.timestamp + 1),
            merkle_root: merkle_root(&transactions),
            state_root: plan.state_root,
            producer_addr: my_addr,
            nonce: 0,
        },
        transactions,
        signature: Signature::empty(),
    };
    block.sign(keypair)?;

    chain.add_block(&block)?;
    pool.remove_many(&block.transactions);
    events.on_new_block(&block).await;
    for tx in &block.transactions {
        events.on_new_transaction(tx, TxStatus::Confirmed).await;
    }

    let message = Message::new(
        MessageType::NewBlock,
        NewBlockPayload {
            block: block.clone(),
        },
        &p2p.node_id(),
    )?;
    p2p.broadcast(&message).await;
    info!(
        "produced block {} at height {} with {} tx(s)",
        block.hash(),
        block.header.height,
        block.transactions.len()
    );
    Ok(())
}
