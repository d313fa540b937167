//! TCP server and connection handling
//!
//! Owns the listener and the live peer table. Accepts and dials connections,
//! runs the Hello handshake, then drives one read loop per active peer.
//! Everything the server learns is reported through the [`ServerEvent`]
//! channel handed out by [`Server::new`].

use crate::network::message::{
    HelloPayload, HelloRejection, Message, MessageType, ProtocolError, MAX_MESSAGE_SIZE,
    PROTOCOL_FAMILY,
};
use crate::network::peer::{Peer, PeerError, PeerState};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Delay before retrying after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Size of the length prefix in front of every frame
const LENGTH_PREFIX_SIZE: usize = 4;

/// Framed read half of a peer connection
pub type PeerReader = FramedRead<OwnedReadHalf, FrameCodec>;

// =============================================================================
// Framing
// =============================================================================

/// Length-prefixed framing: a 4-byte big-endian length, then the frame body.
///
/// Frames are handed out undecoded so that one malformed message does not
/// poison the stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.len())
            .ok()
            .filter(|_| item.len() <= self.max_frame_size)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Frame of {} bytes exceeds limit", item.len()),
                )
            })?;

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(len);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame of {} bytes exceeds limit", len),
            ));
        }

        if src.len() < LENGTH_PREFIX_SIZE + len {
            src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len)))
    }
}

// =============================================================================
// Errors, config, events
// =============================================================================

/// Reasons a handshake fails
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Connection closed during handshake")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Expected HELLO, got {0}")]
    UnexpectedMessage(MessageType),
    #[error("Hello rejected: {0}")]
    Rejected(#[from] HelloRejection),
    #[error("Handshake timed out")]
    TimedOut,
    #[error("Remote presented our own node ID")]
    SelfConnection,
}

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("P2P server is already running")]
    AlreadyRunning,
    #[error("P2P server is not running")]
    NotRunning,
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not resolve peer address {0}")]
    Resolve(String),
    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out dialing {0}")]
    DialTimeout(String),
    #[error("Already connected or connecting to {0}")]
    AlreadyConnected(String),
    #[error("Refusing to connect to own listener {0}")]
    SelfConnection(String),
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Failed to send message to {addr}: {source}")]
    Send {
        addr: String,
        #[source]
        source: PeerError,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. "0.0.0.0:3000"
    pub listen_addr: String,
    /// This node's identity, sent in every Hello and as every message's sender
    pub node_id: Vec<u8>,
    /// Bound on establishing an outbound TCP connection
    pub dial_timeout: Duration,
    /// Bound on the Hello exchange
    pub handshake_timeout: Duration,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            node_id: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: MAX_MESSAGE_SIZE,
            event_buffer: 1024,
        }
    }
}

/// Things the server reports upward, in per-connection order
#[derive(Debug)]
pub enum ServerEvent {
    /// Handshake finished and the peer entered the live table
    PeerConnected(Arc<Peer>),
    /// The peer left the live table
    PeerDisconnected(Arc<Peer>),
    /// A decoded message from an active peer
    Message(Arc<Peer>, Message),
}

struct Running {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

// =============================================================================
// Server
// =============================================================================

/// TCP server for peer connections
pub struct Server {
    config: ServerConfig,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    /// Outbound dials whose handshake has not finished
    dialing: std::sync::Mutex<HashSet<String>>,
    events: mpsc::Sender<ServerEvent>,
    running: Mutex<Option<Running>>,
    tasks: TaskTracker,
    current_height: AtomicI64,
}

impl Server {
    /// Create a server and the receiving end of its event channel
    pub fn new(config: ServerConfig) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let server = Arc::new(Self {
            config,
            peers: RwLock::new(HashMap::new()),
            dialing: std::sync::Mutex::new(HashSet::new()),
            events,
            running: Mutex::new(None),
            tasks: TaskTracker::new(),
            current_height: AtomicI64::new(0),
        });
        (server, events_rx)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &[u8] {
        &self.config.node_id
    }

    /// Height advertised in future Hellos
    pub fn set_current_height(&self, height: i64) {
        self.current_height.store(height, Ordering::Relaxed);
    }

    /// Bind the listener and start accepting connections
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        self.tasks
            .spawn(Arc::clone(self).accept_loop(listener, shutdown.clone()));

        *running = Some(Running {
            shutdown,
            local_addr,
        });
        log::info!(
            "P2P server listening on {} (node ID: {})",
            local_addr,
            hex::encode(&self.config.node_id)
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every peer and wait for all connection tasks
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            log::debug!("P2P server already stopped");
            return;
        };

        running.shutdown.cancel();

        let peers = self.peers().await;
        futures::future::join_all(peers.iter().map(|peer| self.remove_peer(peer))).await;

        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        self.peers.write().await.clear();
        self.lock_dialing().clear();
        log::info!("P2P server on {} stopped", running.local_addr);
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the listener is bound to
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    async fn shutdown_token(&self) -> Option<CancellationToken> {
        self.running.lock().await.as_ref().map(|r| r.shutdown.clone())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        log::debug!("Accept loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        match self.wrap_stream(stream, false, None, &shutdown) {
                            Ok((peer, reader)) => {
                                self.tasks.spawn(Arc::clone(&self).handle_connection(peer, reader));
                            }
                            Err(e) => log::warn!("Failed to set up connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
            }
        }
        log::debug!("Accept loop exited");
    }

    /// Split a stream into a peer (write half) and its framed reader
    fn wrap_stream(
        &self,
        stream: TcpStream,
        is_initiator: bool,
        claimed_id: Option<Vec<u8>>,
        shutdown: &CancellationToken,
    ) -> Result<(Arc<Peer>, PeerReader), std::io::Error> {
        let address = stream.peer_addr()?.to_string();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {}: {}", address, e);
        }

        // Until the Hello arrives the best identity we have is the claim or the address
        let id = claimed_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| address.clone().into_bytes());

        let codec = FrameCodec::new(self.config.max_frame_size);
        let (read_half, write_half) = stream.into_split();
        let peer = Peer::new(
            address,
            is_initiator,
            id,
            FramedWrite::new(write_half, codec),
            shutdown.child_token(),
        );
        Ok((Arc::new(peer), FramedRead::new(read_half, codec)))
    }

    /// Run the handshake, admit the peer, then read until the connection ends
    async fn handle_connection(self: Arc<Self>, peer: Arc<Peer>, mut reader: PeerReader) {
        peer.set_state(PeerState::Handshaking);
        log::debug!(
            "Handshaking with {} (initiator: {})",
            peer.address(),
            peer.is_initiator()
        );

        let outcome = tokio::select! {
            _ = peer.closed() => Err(HandshakeError::ConnectionClosed),
            result = tokio::time::timeout(
                self.config.handshake_timeout,
                self.handshake(&peer, &mut reader),
            ) => result.unwrap_or(Err(HandshakeError::TimedOut)),
        };

        let admitted = match outcome {
            Ok(hello) => {
                log::info!(
                    "Handshake with {} complete: ID {}, version {}, height {}, {} known peers",
                    peer.address(),
                    peer.id_hex(),
                    hello.version,
                    hello.current_height,
                    hello.known_peers.len()
                );
                self.add_peer(&peer).await
            }
            Err(e) => {
                log::warn!("Handshake with {} failed: {}", peer.address(), e);
                false
            }
        };

        if peer.is_initiator() {
            self.lock_dialing().remove(peer.address());
        }

        if !admitted {
            if let Err(e) = peer.close().await {
                log::debug!("Error closing {}: {}", peer.address(), e);
            }
            return;
        }

        self.read_loop(peer, reader).await;
    }

    async fn handshake(
        &self,
        peer: &Peer,
        reader: &mut PeerReader,
    ) -> Result<HelloPayload, HandshakeError> {
        if peer.is_initiator() {
            self.send_hello(peer).await?;
            self.receive_hello(peer, reader).await
        } else {
            let hello = self.receive_hello(peer, reader).await?;
            self.send_hello(peer).await?;
            Ok(hello)
        }
    }

    async fn send_hello(&self, peer: &Peer) -> Result<(), HandshakeError> {
        let listen_addr = match self.local_addr().await {
            Some(addr) => addr.to_string(),
            None => self.config.listen_addr.clone(),
        };
        let known_peers = self
            .peers()
            .await
            .iter()
            .map(|p| p.listen_addr().unwrap_or_else(|| p.address().to_string()))
            .collect();

        let hello = HelloPayload::new(
            listen_addr,
            self.config.node_id.clone(),
            known_peers,
            self.current_height.load(Ordering::Relaxed),
        );
        let msg = Message::with_payload(self.config.node_id.clone(), &hello)?;
        peer.send_frame(Bytes::from(msg.to_bytes()?)).await?;
        log::debug!("Sent HELLO to {}", peer.address());
        Ok(())
    }

    async fn receive_hello(
        &self,
        peer: &Peer,
        reader: &mut PeerReader,
    ) -> Result<HelloPayload, HandshakeError> {
        let frame = reader
            .next()
            .await
            .ok_or(HandshakeError::ConnectionClosed)??;
        let msg = Message::from_bytes(&frame)?;
        if msg.message_type != MessageType::Hello {
            return Err(HandshakeError::UnexpectedMessage(msg.message_type));
        }

        let hello: HelloPayload = msg.decode_payload()?;
        hello.validate(PROTOCOL_FAMILY)?;
        if hello.node_id == self.config.node_id {
            return Err(HandshakeError::SelfConnection);
        }

        // Trust on first use: the asserted ID is not verified
        peer.apply_hello(&hello);
        peer.record_activity();
        Ok(hello)
    }

    async fn read_loop(&self, peer: Arc<Peer>, mut reader: PeerReader) {
        log::debug!("Read loop started for {}", peer.address());

        loop {
            let frame = tokio::select! {
                _ = peer.closed() => break,
                frame = reader.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", peer.address(), e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", peer.address());
                    break;
                }
            };

            let msg = match Message::from_bytes(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!(
                        "Skipping malformed message from {} ({} bytes): {}",
                        peer.address(),
                        frame.len(),
                        e
                    );
                    continue;
                }
            };

            peer.record_activity();
            log::debug!(
                "Received {} from {} ({} bytes)",
                msg.message_type,
                peer.address(),
                frame.len()
            );

            if msg.message_type == MessageType::Hello {
                match msg.decode_payload::<HelloPayload>() {
                    Ok(hello) => {
                        if !hello.node_id.is_empty() && hello.node_id != peer.id() {
                            log::warn!(
                                "Peer {} changed ID from {} to {}",
                                peer.address(),
                                peer.id_hex(),
                                hex::encode(&hello.node_id)
                            );
                        }
                        peer.apply_hello(&hello);
                    }
                    Err(e) => {
                        log::warn!("Skipping bad HELLO from {}: {}", peer.address(), e);
                        continue;
                    }
                }
            } else if !self.is_live(&peer).await {
                log::warn!(
                    "Received {} from {} which is no longer active",
                    msg.message_type,
                    peer.address()
                );
                break;
            }

            let delivered = tokio::select! {
                _ = peer.closed() => false,
                sent = self.events.send(ServerEvent::Message(Arc::clone(&peer), msg)) => sent.is_ok(),
            };
            if !delivered {
                break;
            }
        }

        log::debug!("Read loop for {} exiting", peer.address());
        self.remove_peer(&peer).await;
    }

    /// Dial a peer and start the handshake as the initiating side.
    ///
    /// Returns as soon as the TCP connection exists; the peer becomes active
    /// asynchronously once the Hello exchange completes.
    pub async fn connect(
        self: &Arc<Self>,
        address: &str,
        claimed_id: Option<Vec<u8>>,
    ) -> Result<Arc<Peer>, ServerError> {
        let shutdown = self.shutdown_token().await.ok_or(ServerError::NotRunning)?;

        let target = tokio::time::timeout(self.config.dial_timeout, tokio::net::lookup_host(address))
            .await
            .map_err(|_| ServerError::DialTimeout(address.to_string()))?
            .map_err(|_| ServerError::Resolve(address.to_string()))?
            .next()
            .ok_or_else(|| ServerError::Resolve(address.to_string()))?;
        let key = target.to_string();

        if self.local_addr().await == Some(target) {
            return Err(ServerError::SelfConnection(key));
        }
        if !self.lock_dialing().insert(key.clone()) {
            return Err(ServerError::AlreadyConnected(key));
        }
        if self.peers.read().await.contains_key(&key) {
            self.lock_dialing().remove(&key);
            return Err(ServerError::AlreadyConnected(key));
        }

        log::info!("Connecting to peer {}", key);
        let stream =
            match tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    self.lock_dialing().remove(&key);
                    return Err(ServerError::Dial { addr: key, source });
                }
                Err(_) => {
                    self.lock_dialing().remove(&key);
                    return Err(ServerError::DialTimeout(key));
                }
            };

        let (peer, reader) = match self.wrap_stream(stream, true, claimed_id, &shutdown) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                self.lock_dialing().remove(&key);
                return Err(e.into());
            }
        };

        self.tasks
            .spawn(Arc::clone(self).handle_connection(Arc::clone(&peer), reader));
        Ok(peer)
    }

    fn lock_dialing(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.dialing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a handshaked peer. Returns false if the address is taken or the peer closed.
    async fn add_peer(&self, peer: &Arc<Peer>) -> bool {
        let total = {
            let mut peers = self.peers.write().await;
            if peer.is_closed() {
                return false;
            }
            if let Some(existing) = peers.get(peer.address()) {
                log::warn!(
                    "Duplicate connection to {} (existing ID {}, new ID {}), dropping new one",
                    peer.address(),
                    existing.id_hex(),
                    peer.id_hex()
                );
                return false;
            }
            peers.insert(peer.address().to_string(), Arc::clone(peer));
            peer.set_state(PeerState::Active);
            peers.len()
        };

        log::info!(
            "Added peer {} (ID: {}, outbound: {}). Total active: {}",
            peer.address(),
            peer.id_hex(),
            peer.is_initiator(),
            total
        );
        self.emit(ServerEvent::PeerConnected(Arc::clone(peer))).await;
        true
    }

    /// Remove a peer from the live table and close it.
    ///
    /// Safe to call repeatedly and concurrently; only the call that actually
    /// removes the entry reports a disconnect and returns true.
    pub async fn remove_peer(&self, peer: &Arc<Peer>) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(peer.address()) {
                Some(existing) if Arc::ptr_eq(existing, peer) => peers.remove(peer.address()),
                _ => None,
            }
        };

        if let Err(e) = peer.close().await {
            log::debug!("Error closing {}: {}", peer.address(), e);
        }

        match removed {
            Some(peer) => {
                log::info!("Removed peer {} (ID: {})", peer.address(), peer.id_hex());
                self.emit(ServerEvent::PeerDisconnected(peer)).await;
                true
            }
            None => {
                log::debug!("Peer {} was not in the live table", peer.address());
                false
            }
        }
    }

    async fn emit(&self, event: ServerEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Server event receiver dropped");
        }
    }

    async fn is_live(&self, peer: &Arc<Peer>) -> bool {
        self.peers
            .read()
            .await
            .get(peer.address())
            .is_some_and(|existing| Arc::ptr_eq(existing, peer))
    }

    /// Encode and send one message. A failed write removes the peer; a
    /// message too large to frame is refused and the peer kept.
    pub async fn send_message(&self, peer: &Arc<Peer>, msg: &Message) -> Result<(), ServerError> {
        let frame = self.encode_frame(msg)?;
        self.send_frame(peer, frame, msg.message_type).await
    }

    fn encode_frame(&self, msg: &Message) -> Result<Bytes, ServerError> {
        let frame = msg.to_bytes()?;
        if frame.len() > self.config.max_frame_size {
            return Err(ServerError::FrameTooLarge {
                size: frame.len(),
                limit: self.config.max_frame_size,
            });
        }
        Ok(Bytes::from(frame))
    }

    async fn send_frame(
        &self,
        peer: &Arc<Peer>,
        frame: Bytes,
        message_type: MessageType,
    ) -> Result<(), ServerError> {
        let len = frame.len();
        match peer.send_frame(frame).await {
            Ok(()) => {
                log::debug!("Sent {} to {} ({} bytes)", message_type, peer.address(), len);
                Ok(())
            }
            Err(source) => {
                log::warn!(
                    "Failed to send {} to {}: {}",
                    message_type,
                    peer.address(),
                    source
                );
                self.remove_peer(peer).await;
                Err(ServerError::Send {
                    addr: peer.address().to_string(),
                    source,
                })
            }
        }
    }

    /// Send a message to every live peer except `exclude`.
    ///
    /// Each send runs as its own task so a slow peer holds up nobody else.
    /// Returns the number of sends started.
    pub async fn broadcast(self: &Arc<Self>, msg: &Message, exclude: Option<&Peer>) -> usize {
        let frame = match self.encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} for broadcast: {}", msg.message_type, e);
                return 0;
            }
        };

        let targets = self.snapshot_except(exclude).await;
        log::debug!(
            "Broadcasting {} to {} peers (excluding {})",
            msg.message_type,
            targets.len(),
            exclude.map_or("none", |p| p.address())
        );

        for peer in &targets {
            let server = Arc::clone(self);
            let peer = Arc::clone(peer);
            let frame = frame.clone();
            let message_type = msg.message_type;
            self.tasks.spawn(async move {
                // Failure already logged and the peer removed
                let _ = server.send_frame(&peer, frame, message_type).await;
            });
        }
        targets.len()
    }

    /// Snapshot of live peers; the table lock is released before returning
    async fn snapshot_except(&self, exclude: Option<&Peer>) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| exclude.map_or(true, |ex| p.address() != ex.address()))
            .cloned()
            .collect()
    }

    /// Snapshot of all live peers
    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_addresses(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_by_address(&self, address: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(address).cloned()
    }

    pub async fn peer_by_id(&self, id: &[u8]) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .find(|p| p.id() == id)
            .cloned()
    }
}
