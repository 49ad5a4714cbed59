use crate::chain::{Chain, ChainError};
use crate::p2p::{
    BlocksPayload, GetBlocksPayload, HeightPayload, Message, MessageType, NetworkError, P2pServer,
};
use crate::tx_pool::TxPool;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

pub const SYNC_BATCH_BLOCKS: u64 = 100;
pub const HEIGHT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
pub const BATCH_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Catch-up synchronization. Triggered on startup, on a 30 s timer, and
/// whenever gossip delivers a block from a future height. Concurrent
/// triggers collapse into one run through the atomic guard.
pub struct Syncer {
    chain: Arc<Chain>,
    pool: Arc<TxPool>,
    p2p: Arc<P2pServer>,
    syncing: AtomicBool,
}

impl Syncer {
    pub fn new(chain: Arc<Chain>, pool: Arc<TxPool>, p2p: Arc<P2pServer>) -> Self {
        Syncer {
            chain,
            pool,
            p2p,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Run one sync round. Returns immediately when a round is already in
    /// flight.
    pub async fn sync(&self) -> Result<(), SyncError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already running, trigger ignored");
            return Ok(());
        }
        let result = self.run().await;
        self.syncing.store(false, Ordering::Release);
        if let Err(e) = &result {
            warn!("sync aborted: {e}");
        }
        result
    }

    async fn run(&self) -> Result<(), SyncError> {
        let local_height = self.chain.get_height()?;
        let peers = self.p2p.peer_ids().await;
        if peers.is_empty() {
            debug!("no peers to sync from");
            return Ok(());
        }

        let Some((best_peer, best_height)) = self.poll_heights(&peers).await else {
            debug!("no peer answered the height poll");
            return Ok(());
        };
        if best_height <= local_height {
            return Ok(());
        }
        info!("syncing {local_height} -> {best_height} from {best_peer}");

        let mut next = local_height + 1;
        while next <= best_height {
            let to = (next + SYNC_BATCH_BLOCKS - 1).min(best_height);
            let request = Message::new(
                MessageType::GetBlocks,
                GetBlocksPayload { from: next, to },
                &self.p2p.node_id(),
            )?;
            let reply = self
                .p2p
                .send_and_wait(
                    &best_peer,
                    &request,
                    MessageType::Blocks,
                    BATCH_FETCH_TIMEOUT,
                )
                .await?;
            let payload: BlocksPayload = reply.decode_payload()?;
            if payload.blocks.is_empty() {
                warn!("peer {best_peer} returned no blocks for {next}..{to}");
                break;
            }
            for block in &payload.blocks {
                // a validation failure means a byzantine or misconfigured
                // peer; stop before corrupting the local chain
                self.chain.add_block(block)?;
                self.pool.remove_many(&block.transactions);
                next = block.header.height + 1;
            }
        }

        info!("sync finished at height {}", self.chain.get_height()?);
        Ok(())
    }

    /// Query every peer's height in parallel; non-responders are skipped.
    async fn poll_heights(&self, peers: &[String]) -> Option<(String, u64)> {
        let node_id = self.p2p.node_id();
        let polls = peers.iter().map(|peer| {
            let p2p = self.p2p.clone();
            let node_id = node_id.clone();
            let peer = peer.clone();
            async move {
                let request = Message::new(MessageType::GetHeight, (), &node_id).ok()?;
                let reply = p2p
                    .send_and_wait(&peer, &request, MessageType::Height, HEIGHT_POLL_TIMEOUT)
                    .await
                    .ok()?;
                let payload: HeightPayload = reply.decode_payload().ok()?;
                Some((peer, payload.height))
            }
        });
        join_all(polls)
            .await
            .into_iter()
            .flatten()
            .max_by_key(|(_, height)| *height)
    }
}
