use crate::crypto::Hash;
use crate::types::{Block, Transaction, unix_now};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, oneshot, watch};

/// Frames above this size are a protocol violation and close the connection.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

const BOOTSTRAP_ATTEMPTS: usize = 3;
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(String),
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    PeerDisconnect,
    #[error("unknown peer {0}")]
    PeerNotFound(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Closed enumeration of wire message types. The numeric codes are part of
/// the protocol; adding a code is a breaking change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    GetPeers = 2,
    Peers = 3,
    NewBlock = 4,
    GetBlocks = 5,
    Blocks = 6,
    NewTransaction = 7,
    GetBlockByHeight = 8,
    GetBlockByHash = 9,
    GetState = 10,
    GetHeight = 11,
    Height = 12,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            0 => Some(MessageType::Ping),
            1 => Some(MessageType::Pong),
            2 => Some(MessageType::GetPeers),
            3 => Some(MessageType::Peers),
            4 => Some(MessageType::NewBlock),
            5 => Some(MessageType::GetBlocks),
            6 => Some(MessageType::Blocks),
            7 => Some(MessageType::NewTransaction),
            8 => Some(MessageType::GetBlockByHeight),
            9 => Some(MessageType::GetBlockByHash),
            10 => Some(MessageType::GetState),
            11 => Some(MessageType::GetHeight),
            12 => Some(MessageType::Height),
            _ => None,
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        MessageType::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown message type {code}")))
    }
}

/// The wire envelope: `{"type": <u8>, "payload": <object>, "from": <id>}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub from: String,
}

impl Message {
    pub fn new<P: Serialize>(
        kind: MessageType,
        payload: P,
        from: &str,
    ) -> Result<Message, NetworkError> {
        Ok(Message {
            kind,
            payload: serde_json::to_value(payload)?,
            from: from.to_string(),
        })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// Payloads for the closed message set.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingPayload {
    pub time: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongPayload {
    pub time: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeersPayload {
    pub peers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBlockPayload {
    pub block: Block,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub from: u64,
    pub to: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlocksPayload {
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTransactionPayload {
    pub transaction: Transaction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlockByHeightPayload {
    pub height: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlockByHashPayload {
    pub hash: Hash,
}

/// Request carries the key; the response echoes it with the value filled
/// in (hex) when present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetStatePayload {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeightPayload {
    pub height: u64,
}

/// An inbound-message handler. Returning a message sends it back to the
/// originating peer.
pub type Handler = Arc<dyn Fn(String, Message) -> BoxFuture<'static, Option<Message>> + Send + Sync>;

struct Peer {
    id: String,
    writer: Mutex<OwnedWriteHalf>,
}

impl Peer {
    async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let bytes = serde_json::to_vec(message)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NetworkError::Frame(format!(
                "outbound frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte cap",
                bytes.len()
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Message, NetworkError> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length == 0 || length > MAX_FRAME_BYTES {
        return Err(NetworkError::Frame(format!("bad frame length {length}")));
    }
    let mut buffer = vec![0u8; length];
    reader.read_exact(&mut buffer).await?;
    Ok(serde_json::from_slice(&buffer)?)
}

/// TCP gossip server: accept loop, per-peer read loops, handler dispatch and
/// correlated request/response used by the syncer.
pub struct P2pServer {
    node_id: String,
    listen_addr: String,
    max_peers: usize,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    handlers: StdMutex<HashMap<u8, Handler>>,
    pending: StdMutex<HashMap<(String, u8), oneshot::Sender<Message>>>,
    bound: StdMutex<Option<SocketAddr>>,
    shutdown: watch::Receiver<bool>,
}

impl P2pServer {
    pub fn new(listen_addr: String, max_peers: usize, shutdown: watch::Receiver<bool>) -> Self {
        P2pServer {
            node_id: listen_addr.clone(),
            listen_addr,
            max_peers,
            peers: RwLock::new(HashMap::new()),
            handlers: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            bound: StdMutex::new(None),
            shutdown,
        }
    }

    /// The identifier stamped into the `from` field of outbound messages.
    pub fn node_id(&self) -> String {
        self.node_id.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    pub fn register_handler(&self, kind: MessageType, handler: Handler) {
        self.handlers.lock().unwrap().insert(kind as u8, handler);
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(addr);
        info!("p2p listening on {addr}");

        let server = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                if server.peers.read().await.len() >= server.max_peers {
                                    warn!("peer cap reached, dropping inbound {remote}");
                                    continue;
                                }
                                server.clone().register_connection(stream, remote.to_string()).await;
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                            }
                        }
                    }
                }
            }
            debug!("accept loop stopped");
        });
        Ok(addr)
    }

    /// Dial a peer. A no-op when the peer is already connected.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), NetworkError> {
        if self.peers.read().await.contains_key(addr) {
            return Ok(());
        }
        let stream = TcpStream::connect(addr).await?;
        self.clone().register_connection(stream, addr.to_string()).await;
        info!("connected to peer {addr}");
        Ok(())
    }

    /// Dial the bootstrap set, retrying transient failures. Never fatal.
    pub async fn bootstrap(self: &Arc<Self>, peers: &[String]) {
        for addr in peers {
            let mut connected = false;
            for attempt in 1..=BOOTSTRAP_ATTEMPTS {
                match self.connect(addr).await {
                    Ok(()) => {
                        connected = true;
                        break;
                    }
                    Err(e) => {
                        debug!("bootstrap dial {addr} attempt {attempt} failed: {e}");
                        tokio::time::sleep(BOOTSTRAP_RETRY_DELAY).await;
                    }
                }
            }
            if !connected {
                warn!("could not reach bootstrap peer {addr}");
            }
        }
    }

    async fn register_connection(self: Arc<Self>, stream: TcpStream, peer_id: String) {
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(Peer {
            id: peer_id.clone(),
            writer: Mutex::new(writer),
        });
        self.peers.write().await.insert(peer_id, peer.clone());
        let server = self.clone();
        tokio::spawn(async move {
            server.read_loop(reader, peer).await;
        });
    }

    /// One read loop per peer. Responses matching an outstanding request
    /// wake the waiter; everything else goes through handler dispatch.
    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, peer: Arc<Peer>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("peer {} read failed: {e}", peer.id);
                        break;
                    }
                },
            };

            let pending_key = (peer.id.clone(), message.kind as u8);
            let waiter = self.pending.lock().unwrap().remove(&pending_key);
            if let Some(sender) = waiter {
                let _ = sender.send(message);
                continue;
            }

            if message.kind == MessageType::Ping {
                let pong = Message::new(
                    MessageType::Pong,
                    PongPayload { time: unix_now() },
                    &self.node_id,
                );
                match pong {
                    Ok(pong) => {
                        if peer.send(&pong).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("could not encode pong: {e}"),
                }
                continue;
            }

            let handler = self
                .handlers
                .lock()
                .unwrap()
                .get(&(message.kind as u8))
                .cloned();
            match handler {
                Some(handler) => {
                    if let Some(response) = handler(peer.id.clone(), message).await {
                        if peer.send(&response).await.is_err() {
                            break;
                        }
                    }
                }
                None => {
                    debug!("no handler for {:?} from {}", message.kind, peer.id);
                }
            }
        }
        self.remove_peer(&peer.id).await;
    }

    async fn remove_peer(&self, peer_id: &str) {
        if self.peers.write().await.remove(peer_id).is_some() {
            info!("peer {peer_id} disconnected");
        }
        // wake any request still waiting on this peer
        self.pending
            .lock()
            .unwrap()
            .retain(|(pending_peer, _), _| pending_peer != peer_id);
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn send_to(&self, peer_id: &str, message: &Message) -> Result<(), NetworkError> {
        let peer = self
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;
        if let Err(e) = peer.send(message).await {
            warn!("send to {peer_id} failed: {e}");
            self.remove_peer(peer_id).await;
            return Err(NetworkError::PeerDisconnect);
        }
        Ok(())
    }

    /// Fire-and-forget delivery to every connected peer.
    pub async fn broadcast(&self, message: &Message) {
        self.broadcast_except(message, "").await;
    }

    /// Broadcast to every peer except `except` (the gossip originator).
    pub async fn broadcast_except(&self, message: &Message, except: &str) {
        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if peer.id == except {
                continue;
            }
            if let Err(e) = peer.send(message).await {
                warn!("broadcast to {} failed: {e}", peer.id);
                self.remove_peer(&peer.id).await;
            }
        }
    }

    /// Send a request and wait for the next message of `expected` kind from
    /// that peer. Times out and unregisters the waiter after `timeout`.
    pub async fn send_and_wait(
        &self,
        peer_id: &str,
        message: &Message,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<Message, NetworkError> {
        let key = (peer_id.to_string(), expected as u8);
        let (sender, receiver) = oneshot::channel();
        if self
            .pending
            .lock()
            .unwrap()
            .insert(key.clone(), sender)
            .is_some()
        {
            warn!("replaced an outstanding {expected:?} wait for {peer_id}");
        }

        if let Err(e) = self.send_to(peer_id, message).await {
            self.pending.lock().unwrap().remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::PeerDisconnect),
            Err(_) => {
                self.pending.lock().unwrap().remove(&key);
                Err(NetworkError::Timeout)
            }
        }
    }
}
