//! Network manager
//!
//! Sits on top of the [`Server`]: keeps the address book, dials new peers,
//! prunes idle ones, routes incoming messages to the chain layer and gossips
//! blocks and transactions onward.

use crate::core::{ChainCodec, CodecError};
use crate::network::message::{
    BlockRequestPayload, BlockResponsePayload, BlockVotePayload, HelloPayload, Message,
    MessageType, NewBlockProposalPayload, NewTransactionPayload, PeerListPayload, Payload,
    ProtocolError, MAX_MESSAGE_SIZE,
};
use crate::network::peer::Peer;
use crate::network::server::{Server, ServerConfig, ServerError, ServerEvent};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Most addresses sent in one PeerList reply
pub const MAX_PEER_LIST_LEN: usize = 1000;

/// Idle time, in maintenance intervals, after which a peer is dropped
pub const STALE_INTERVALS: u32 = 3;

// =============================================================================
// Errors
// =============================================================================

/// Network manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Invalid configuration: {0}")]
    Init(String),
    #[error("Network manager already running")]
    AlreadyRunning,
    #[error("Network manager not running")]
    NotRunning,
    #[error("Network manager was stopped and cannot be restarted")]
    Stopped,
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
    #[error("Peer {0} not found")]
    PeerNotFound(String),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Network manager configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to bind, e.g. "0.0.0.0:3000"
    pub listen_addr: String,
    /// This node's identity
    pub node_id: Vec<u8>,
    /// Addresses seeded into the address book
    pub bootstrap_peers: Vec<String>,
    /// Discovery stops dialing once this many peers are active
    pub max_desired_peers: usize,
    pub discovery_interval: Duration,
    pub maintenance_interval: Duration,
    /// Pause between two dials of one discovery round
    pub dial_stagger: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Capacity of the incoming block channel
    pub block_buffer: usize,
    /// Capacity of the incoming transaction channel
    pub transaction_buffer: usize,
    /// Capacity of the sync event channel
    pub sync_buffer: usize,
    /// Capacity of the server event channel
    pub event_buffer: usize,
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            node_id: Vec::new(),
            bootstrap_peers: Vec::new(),
            max_desired_peers: 10,
            discovery_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(15),
            dial_stagger: Duration::from_millis(50),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            block_buffer: 100,
            transaction_buffer: 1000,
            sync_buffer: 100,
            event_buffer: 1024,
            max_frame_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Check the settings the manager cannot run without
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.node_id.is_empty() {
            return Err(ManagerError::Init("node ID must not be empty".into()));
        }
        if self.listen_addr.is_empty() {
            return Err(ManagerError::Init("listen address must not be empty".into()));
        }
        let buffers = [
            ("block_buffer", self.block_buffer),
            ("transaction_buffer", self.transaction_buffer),
            ("sync_buffer", self.sync_buffer),
            ("event_buffer", self.event_buffer),
            ("max_frame_size", self.max_frame_size),
        ];
        for (name, value) in buffers {
            if value == 0 {
                return Err(ManagerError::Init(format!("{} must be positive", name)));
            }
        }
        if u32::try_from(self.max_frame_size).is_err() {
            return Err(ManagerError::Init(
                "max_frame_size must fit a 32-bit length prefix".into(),
            ));
        }
        if self.discovery_interval.is_zero() || self.maintenance_interval.is_zero() {
            return Err(ManagerError::Init("intervals must be non-zero".into()));
        }
        for addr in &self.bootstrap_peers {
            if !is_valid_peer_address(addr) {
                return Err(ManagerError::InvalidPeerAddress(addr.clone()));
            }
        }
        Ok(())
    }

    /// Settings for the underlying server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr.clone(),
            node_id: self.node_id.clone(),
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            max_frame_size: self.max_frame_size,
            event_buffer: self.event_buffer,
        }
    }

    /// Idle time after which an active peer is pruned
    pub fn stale_after(&self) -> Duration {
        self.maintenance_interval * STALE_INTERVALS
    }
}

/// `host:port` with a non-empty host and a numeric port
pub fn is_valid_peer_address(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !host.contains(char::is_whitespace) && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Chain sync traffic handed to the consumer of [`NetworkManager::take_sync_receiver`]
#[derive(Debug)]
pub enum SyncEvent<B> {
    /// A peer asked for a block; answer with [`NetworkManager::send_block_to`]
    BlockRequested {
        peer_id: Vec<u8>,
        block_hash: Vec<u8>,
        height: i64,
    },
    /// A block sent in answer to one of our requests
    BlockReceived { peer_id: Vec<u8>, block: B },
    /// A validator's vote
    VoteReceived {
        peer_id: Vec<u8>,
        vote: BlockVotePayload,
    },
}

struct Outlets<C: ChainCodec> {
    blocks: mpsc::Sender<C::Block>,
    transactions: mpsc::Sender<C::Transaction>,
    sync: mpsc::Sender<SyncEvent<C::Block>>,
}

struct Inlets<C: ChainCodec> {
    blocks: Option<mpsc::Receiver<C::Block>>,
    transactions: Option<mpsc::Receiver<C::Transaction>>,
    sync: Option<mpsc::Receiver<SyncEvent<C::Block>>>,
}

enum Lifecycle {
    Idle(mpsc::Receiver<ServerEvent>),
    Running,
    Stopped,
}

// =============================================================================
// Shared state
// =============================================================================

struct Shared<C: ChainCodec> {
    config: NetworkConfig,
    server: Arc<Server>,
    codec: C,
    /// Address book: address -> node ID when known
    known_addresses: RwLock<HashMap<String, Option<Vec<u8>>>>,
    /// Mirror of the server's live table, fed by its events
    active_peers: RwLock<HashMap<String, Arc<Peer>>>,
    /// Dropped on stop, which ends every receiver
    outlets: std::sync::RwLock<Option<Outlets<C>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<C: ChainCodec> Shared<C> {
    fn read_outlets(&self) -> RwLockReadGuard<'_, Option<Outlets<C>>> {
        self.outlets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_outlets(&self) -> RwLockWriteGuard<'_, Option<Outlets<C>>> {
        self.outlets.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn node_id(&self) -> Vec<u8> {
        self.config.node_id.clone()
    }

    async fn run_dispatcher(self: Arc<Self>, mut events: mpsc::Receiver<ServerEvent>) {
        log::debug!("Network event dispatcher started");
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ServerEvent::PeerConnected(peer) => self.handle_peer_connected(peer).await,
                ServerEvent::PeerDisconnected(peer) => self.handle_peer_disconnected(&peer).await,
                ServerEvent::Message(peer, msg) => self.handle_incoming_message(&peer, msg).await,
            }
        }
        log::debug!("Network event dispatcher stopped");
    }

    async fn run_discovery(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.discover_and_connect().await;
                }
            }
        }
        log::debug!("Peer discovery stopped");
    }

    async fn run_maintenance(self: Arc<Self>) {
        let period = self.config.maintenance_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.prune_stale_connections_at(Instant::now()).await;
                }
            }
        }
        log::debug!("Connection maintenance stopped");
    }

    /// Addresses that lead back to this node
    async fn own_addresses(&self) -> HashSet<String> {
        let mut own = HashSet::from([self.config.listen_addr.clone()]);
        if let Some(local) = self.server.local_addr().await {
            own.insert(local.to_string());
            if local.ip().is_unspecified() {
                own.insert(format!("127.0.0.1:{}", local.port()));
                own.insert(format!("localhost:{}", local.port()));
            }
        }
        own
    }

    async fn discover_and_connect(self: &Arc<Self>) -> usize {
        let own = self.own_addresses().await;

        let (mut candidates, budget) = {
            let known = self.known_addresses.read().await;
            let active = self.active_peers.read().await;

            let budget = self.config.max_desired_peers.saturating_sub(active.len());
            if budget == 0 {
                log::debug!("Discovery: {} active peers, nothing to do", active.len());
                return 0;
            }

            let mut active_addrs: HashSet<String> = active.keys().cloned().collect();
            active_addrs.extend(active.values().filter_map(|p| p.listen_addr()));
            let active_ids: HashSet<Vec<u8>> = active.values().map(|p| p.id()).collect();

            let candidates: Vec<(String, Option<Vec<u8>>)> = known
                .iter()
                .filter(|(addr, _)| !active_addrs.contains(*addr) && !own.contains(*addr))
                .filter(|(_, id)| match id {
                    Some(id) => !active_ids.contains(id),
                    None => true,
                })
                .map(|(addr, id)| (addr.clone(), id.clone()))
                .collect();
            (candidates, budget)
        };

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(budget);
        if candidates.is_empty() {
            log::debug!("Discovery: no new addresses to try");
            return 0;
        }
        log::info!("Discovery: dialing {} candidate peers", candidates.len());

        let mut launched = 0;
        for (addr, claimed_id) in candidates {
            if launched > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.dial_stagger) => {}
                }
            }

            let server = Arc::clone(&self.server);
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = server.connect(&addr, claimed_id) => match result {
                        Ok(peer) => log::debug!("Dialed {} ({})", addr, peer.address()),
                        Err(ServerError::AlreadyConnected(key)) => {
                            log::debug!("Skipping {}: already connected as {}", addr, key)
                        }
                        Err(e) => log::warn!("Failed to connect to {}: {}", addr, e),
                    },
                }
            });
            launched += 1;
        }
        launched
    }

    async fn prune_stale_connections_at(&self, now: Instant) -> usize {
        let stale_after = self.config.stale_after();
        let stale: Vec<Arc<Peer>> = self
            .active_peers
            .read()
            .await
            .values()
            .filter(|p| now.saturating_duration_since(p.last_activity()) > stale_after)
            .cloned()
            .collect();

        for peer in &stale {
            log::info!(
                "Pruning stale peer {} (ID: {}, idle {:?})",
                peer.address(),
                peer.id_hex(),
                now.saturating_duration_since(peer.last_activity())
            );
            self.server.remove_peer(peer).await;
            self.forget_active(peer).await;
        }
        stale.len()
    }

    async fn forget_active(&self, peer: &Arc<Peer>) -> bool {
        let mut active = self.active_peers.write().await;
        match active.get(peer.address()) {
            Some(existing) if Arc::ptr_eq(existing, peer) => {
                active.remove(peer.address());
                true
            }
            _ => false,
        }
    }

    async fn handle_peer_connected(self: &Arc<Self>, peer: Arc<Peer>) {
        // Its disconnect overtook this event and was already handled
        if peer.is_closed() {
            log::debug!("Ignoring connect of already closed peer {}", peer.address());
            return;
        }

        // Known before active, so active keys stay a subset of known keys
        {
            let mut known = self.known_addresses.write().await;
            known.insert(peer.address().to_string(), Some(peer.id()));
            if let Some(listen_addr) = peer.listen_addr() {
                if is_valid_peer_address(&listen_addr) {
                    known.insert(listen_addr, Some(peer.id()));
                }
            }
            for addr in peer.known_peers() {
                if is_valid_peer_address(&addr) {
                    known.entry(addr).or_insert(None);
                }
            }
        }

        let total = {
            let mut active = self.active_peers.write().await;
            active.insert(peer.address().to_string(), Arc::clone(&peer));
            active.len()
        };
        log::info!(
            "Peer {} (ID: {}) active. Active peers: {}",
            peer.address(),
            peer.id_hex(),
            total
        );

        let request = Message::new(MessageType::RequestPeerList, self.node_id(), Vec::new());
        self.spawn_send(peer, request);
    }

    async fn handle_peer_disconnected(&self, peer: &Arc<Peer>) {
        if self.forget_active(peer).await {
            log::info!(
                "Peer {} (ID: {}) no longer active",
                peer.address(),
                peer.id_hex()
            );
        }
    }

    async fn merge_addresses(&self, addresses: impl IntoIterator<Item = String>) -> usize {
        let mut known = self.known_addresses.write().await;
        let before = known.len();
        for addr in addresses {
            if is_valid_peer_address(&addr) {
                known.entry(addr).or_insert(None);
            } else {
                log::debug!("Ignoring malformed peer address '{}'", addr);
            }
        }
        known.len() - before
    }

    async fn handle_incoming_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: Message) {
        log::debug!(
            "Received {} from {} (ID: {})",
            msg.message_type,
            peer.address(),
            peer.id_hex()
        );
        peer.record_activity();

        match msg.message_type {
            MessageType::Hello => {
                let Some(hello) = decode_or_log::<HelloPayload>(&msg, peer) else {
                    return;
                };
                let mut addresses = hello.known_peers;
                addresses.push(hello.listen_addr);
                let added = self.merge_addresses(addresses).await;
                log::debug!("Hello refresh from {} added {} addresses", peer.address(), added);
            }

            MessageType::PeerList => {
                let Some(list) = decode_or_log::<PeerListPayload>(&msg, peer) else {
                    return;
                };
                let received = list.peers.len();
                let added = self.merge_addresses(list.peers).await;
                log::info!(
                    "Received PeerList from {}: {} addresses, {} new",
                    peer.address(),
                    received,
                    added
                );
            }

            MessageType::RequestPeerList => {
                let exclude = peer.listen_addr();
                let peers: Vec<String> = self
                    .known_addresses
                    .read()
                    .await
                    .keys()
                    .filter(|addr| *addr != peer.address() && Some(*addr) != exclude.as_ref())
                    .take(MAX_PEER_LIST_LEN)
                    .cloned()
                    .collect();
                match Message::with_payload(self.node_id(), &PeerListPayload { peers }) {
                    Ok(reply) => self.spawn_send(Arc::clone(peer), reply),
                    Err(e) => log::error!("Failed to encode PeerList: {}", e),
                }
            }

            MessageType::NewBlockProposal => {
                let Some(proposal) = decode_or_log::<NewBlockProposalPayload>(&msg, peer) else {
                    return;
                };
                let block = match self.codec.decode_block(&proposal.block_data) {
                    Ok(block) => block,
                    Err(e) => {
                        log::warn!("Failed to decode block from {}: {}", peer.address(), e);
                        return;
                    }
                };
                self.deliver(block, "block", peer, |outlets| &outlets.blocks);
                self.gossip(MessageType::NewBlockProposal, msg.payload, peer)
                    .await;
            }

            MessageType::NewTransaction => {
                let Some(payload) = decode_or_log::<NewTransactionPayload>(&msg, peer) else {
                    return;
                };
                let tx = match self.codec.decode_transaction(&payload.transaction_data) {
                    Ok(tx) => tx,
                    Err(e) => {
                        log::warn!("Failed to decode transaction from {}: {}", peer.address(), e);
                        return;
                    }
                };
                self.deliver(tx, "transaction", peer, |outlets| &outlets.transactions);
                self.gossip(MessageType::NewTransaction, msg.payload, peer)
                    .await;
            }

            MessageType::BlockRequest => {
                let Some(request) = decode_or_log::<BlockRequestPayload>(&msg, peer) else {
                    return;
                };
                self.deliver_sync(
                    SyncEvent::BlockRequested {
                        peer_id: peer.id(),
                        block_hash: request.block_hash,
                        height: request.height,
                    },
                    peer,
                );
            }

            MessageType::BlockResponse => {
                let Some(response) = decode_or_log::<BlockResponsePayload>(&msg, peer) else {
                    return;
                };
                match self.codec.decode_block(&response.block_data) {
                    Ok(block) => self.deliver_sync(
                        SyncEvent::BlockReceived {
                            peer_id: peer.id(),
                            block,
                        },
                        peer,
                    ),
                    Err(e) => {
                        log::warn!("Failed to decode block response from {}: {}", peer.address(), e)
                    }
                }
            }

            MessageType::BlockVote => {
                let Some(vote) = decode_or_log::<BlockVotePayload>(&msg, peer) else {
                    return;
                };
                self.deliver_sync(
                    SyncEvent::VoteReceived {
                        peer_id: peer.id(),
                        vote,
                    },
                    peer,
                );
            }

            MessageType::AuditLog | MessageType::WealthUpdate => {
                log::debug!(
                    "Ignoring {} from {} ({} bytes)",
                    msg.message_type,
                    peer.address(),
                    msg.payload.len()
                );
            }

            MessageType::Unknown(_) => {
                log::warn!(
                    "Unhandled message type {} from {}",
                    msg.message_type,
                    peer.address()
                );
            }
        }
    }

    /// Hand an item to its consumer without waiting. Dropped if the channel is full.
    fn deliver<T>(
        &self,
        item: T,
        what: &str,
        from: &Peer,
        pick: impl FnOnce(&Outlets<C>) -> &mpsc::Sender<T>,
    ) {
        let outlets = self.read_outlets();
        let Some(outlets) = outlets.as_ref() else {
            log::debug!("Network stopped, dropping {} from {}", what, from.address());
            return;
        };
        match pick(outlets).try_send(item) {
            Ok(()) => log::debug!("Routed {} from {}", what, from.address()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Incoming {} channel full, dropping {} from {}", what, what, from.address())
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("No consumer for {}, dropping item from {}", what, from.address())
            }
        }
    }

    fn deliver_sync(&self, event: SyncEvent<C::Block>, from: &Peer) {
        self.deliver(event, "sync event", from, |outlets| &outlets.sync);
    }

    /// Forward a payload to every peer except the one it came from
    async fn gossip(&self, message_type: MessageType, payload: Vec<u8>, origin: &Peer) {
        let msg = Message::new(message_type, self.node_id(), payload);
        let sent = self.server.broadcast(&msg, Some(origin)).await;
        log::debug!(
            "Gossiped {} from {} to {} peers",
            message_type,
            origin.address(),
            sent
        );
    }

    /// Send without holding up the caller; gives up on shutdown
    fn spawn_send(self: &Arc<Self>, peer: Arc<Peer>, msg: Message) {
        let server = Arc::clone(&self.server);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = server.send_message(&peer, &msg) => {
                    if let Err(e) = result {
                        log::debug!("Failed to send {} to {}: {}", msg.message_type, peer.address(), e);
                    }
                }
            }
        });
    }

    async fn active_peer_by_id(&self, peer_id: &[u8]) -> Result<Arc<Peer>, ManagerError> {
        self.active_peers
            .read()
            .await
            .values()
            .find(|p| p.id() == peer_id)
            .cloned()
            .ok_or_else(|| ManagerError::PeerNotFound(hex::encode(peer_id)))
    }

    async fn send_to(&self, peer_id: &[u8], msg: Message) -> Result<(), ManagerError> {
        let peer = self.active_peer_by_id(peer_id).await?;
        self.server.send_message(&peer, &msg).await?;
        Ok(())
    }
}

fn decode_or_log<P: Payload>(msg: &Message, from: &Peer) -> Option<P> {
    match msg.decode_payload::<P>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            log::warn!(
                "Dropping {} from {}: {}",
                msg.message_type,
                from.address(),
                e
            );
            None
        }
    }
}

// =============================================================================
// Network Manager
// =============================================================================

/// Peer management, discovery and message routing for one node
pub struct NetworkManager<C: ChainCodec> {
    shared: Arc<Shared<C>>,
    lifecycle: Mutex<Lifecycle>,
    inlets: std::sync::Mutex<Inlets<C>>,
}

impl<C: ChainCodec> NetworkManager<C> {
    /// Create a manager and its server. Nothing touches the network until [`start`](Self::start).
    pub fn new(config: NetworkConfig, codec: C) -> Result<Self, ManagerError> {
        config.validate()?;

        let (server, events) = Server::new(config.server_config());
        let (block_tx, block_rx) = mpsc::channel(config.block_buffer);
        let (tx_tx, tx_rx) = mpsc::channel(config.transaction_buffer);
        let (sync_tx, sync_rx) = mpsc::channel(config.sync_buffer);

        let known: HashMap<String, Option<Vec<u8>>> = config
            .bootstrap_peers
            .iter()
            .map(|addr| (addr.clone(), None))
            .collect();
        log::info!(
            "Network manager created for node {} with {} bootstrap peers",
            hex::encode(&config.node_id),
            known.len()
        );

        let shared = Arc::new(Shared {
            config,
            server,
            codec,
            known_addresses: RwLock::new(known),
            active_peers: RwLock::new(HashMap::new()),
            outlets: std::sync::RwLock::new(Some(Outlets {
                blocks: block_tx,
                transactions: tx_tx,
                sync: sync_tx,
            })),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        Ok(Self {
            shared,
            lifecycle: Mutex::new(Lifecycle::Idle(events)),
            inlets: std::sync::Mutex::new(Inlets {
                blocks: Some(block_rx),
                transactions: Some(tx_rx),
                sync: Some(sync_rx),
            }),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn node_id(&self) -> &[u8] {
        &self.shared.config.node_id
    }

    /// Start the server, then the dispatcher, discovery and maintenance tasks
    pub async fn start(&self) -> Result<SocketAddr, ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let events = match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
            Lifecycle::Idle(events) => events,
            Lifecycle::Running => return Err(ManagerError::AlreadyRunning),
            Lifecycle::Stopped => {
                *lifecycle = Lifecycle::Stopped;
                return Err(ManagerError::Stopped);
            }
        };

        let local_addr = match self.shared.server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                *lifecycle = Lifecycle::Idle(events);
                return Err(e.into());
            }
        };

        let shared = &self.shared;
        shared.tasks.spawn(Arc::clone(shared).run_dispatcher(events));
        shared.tasks.spawn(Arc::clone(shared).run_discovery());
        shared.tasks.spawn(Arc::clone(shared).run_maintenance());

        log::info!(
            "Network manager started on {} (max peers: {}, discovery every {:?}, maintenance every {:?})",
            local_addr,
            shared.config.max_desired_peers,
            shared.config.discovery_interval,
            shared.config.maintenance_interval
        );
        Ok(local_addr)
    }

    /// Stop every task and the server, and close the delivery channels
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Running) {
            return Err(ManagerError::NotRunning);
        }
        *lifecycle = Lifecycle::Stopped;

        let shared = &self.shared;
        shared.shutdown.cancel();
        shared.tasks.close();
        shared.tasks.wait().await;

        shared.server.stop().await;
        *shared.write_outlets() = None;
        shared.active_peers.write().await.clear();

        log::info!("Network manager stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running)
    }

    /// One discovery round. Returns the number of dials launched.
    pub async fn discover_and_connect(&self) -> usize {
        self.shared.discover_and_connect().await
    }

    /// Drop every active peer idle for longer than [`NetworkConfig::stale_after`]
    pub async fn prune_stale_connections(&self) -> usize {
        self.shared.prune_stale_connections_at(Instant::now()).await
    }

    /// Same as [`prune_stale_connections`](Self::prune_stale_connections), judged at `now`
    pub async fn prune_stale_connections_at(&self, now: Instant) -> usize {
        self.shared.prune_stale_connections_at(now).await
    }

    /// Route one message from `peer`. The dispatcher calls this for every inbound message.
    pub async fn handle_incoming_message(&self, peer: &Arc<Peer>, msg: Message) {
        self.shared.handle_incoming_message(peer, msg).await
    }

    // -------------------------------------------------------------------------
    // Targeted sends
    // -------------------------------------------------------------------------

    /// Send a block to one peer, as the answer to its request
    pub async fn send_block_to(&self, peer_id: &[u8], block: &C::Block) -> Result<(), ManagerError> {
        let block_data = self.shared.codec.encode_block(block)?;
        let msg = Message::with_payload(self.node_id().to_vec(), &BlockResponsePayload { block_data })?;
        self.shared.send_to(peer_id, msg).await
    }

    /// Ask one peer for a block by hash, or by height when the hash is empty
    pub async fn request_block_from(
        &self,
        peer_id: &[u8],
        block_hash: Vec<u8>,
        height: i64,
    ) -> Result<(), ManagerError> {
        let payload = BlockRequestPayload { block_hash, height };
        let msg = Message::with_payload(self.node_id().to_vec(), &payload)?;
        self.shared.send_to(peer_id, msg).await
    }

    pub async fn send_vote_to(
        &self,
        peer_id: &[u8],
        vote: &BlockVotePayload,
    ) -> Result<(), ManagerError> {
        let msg = Message::with_payload(self.node_id().to_vec(), vote)?;
        self.shared.send_to(peer_id, msg).await
    }

    pub async fn send_transaction_to(
        &self,
        peer_id: &[u8],
        tx: &C::Transaction,
    ) -> Result<(), ManagerError> {
        let transaction_data = self.shared.codec.encode_transaction(tx)?;
        let msg = Message::with_payload(
            self.node_id().to_vec(),
            &NewTransactionPayload { transaction_data },
        )?;
        self.shared.send_to(peer_id, msg).await
    }

    /// Propose a locally produced block to every peer. Returns the number of sends started.
    pub async fn broadcast_block(&self, block: &C::Block) -> Result<usize, ManagerError> {
        let block_data = self.shared.codec.encode_block(block)?;
        let msg = Message::with_payload(
            self.node_id().to_vec(),
            &NewBlockProposalPayload { block_data },
        )?;
        Ok(self.shared.server.broadcast(&msg, None).await)
    }

    /// Announce a locally submitted transaction to every peer
    pub async fn broadcast_transaction(&self, tx: &C::Transaction) -> Result<usize, ManagerError> {
        let transaction_data = self.shared.codec.encode_transaction(tx)?;
        let msg = Message::with_payload(
            self.node_id().to_vec(),
            &NewTransactionPayload { transaction_data },
        )?;
        Ok(self.shared.server.broadcast(&msg, None).await)
    }

    // -------------------------------------------------------------------------
    // Receivers
    // -------------------------------------------------------------------------

    fn lock_inlets(&self) -> std::sync::MutexGuard<'_, Inlets<C>> {
        self.inlets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks proposed by peers. Returns `None` after the first call.
    pub fn take_block_receiver(&self) -> Option<mpsc::Receiver<C::Block>> {
        self.lock_inlets().blocks.take()
    }

    /// Transactions announced by peers. Returns `None` after the first call.
    pub fn take_transaction_receiver(&self) -> Option<mpsc::Receiver<C::Transaction>> {
        self.lock_inlets().transactions.take()
    }

    /// Block requests, block responses and votes. Returns `None` after the first call.
    pub fn take_sync_receiver(&self) -> Option<mpsc::Receiver<SyncEvent<C::Block>>> {
        self.lock_inlets().sync.take()
    }

    // -------------------------------------------------------------------------
    // Address book and peers
    // -------------------------------------------------------------------------

    /// Add an address to the address book. Returns true if it was new.
    ///
    /// A node ID given here fills in one that was not known yet.
    pub async fn add_known_address(
        &self,
        address: &str,
        node_id: Option<Vec<u8>>,
    ) -> Result<bool, ManagerError> {
        if !is_valid_peer_address(address) {
            return Err(ManagerError::InvalidPeerAddress(address.to_string()));
        }
        let mut known = self.shared.known_addresses.write().await;
        match known.get_mut(address) {
            Some(existing) => {
                if existing.is_none() && node_id.is_some() {
                    *existing = node_id;
                }
                Ok(false)
            }
            None => {
                known.insert(address.to_string(), node_id);
                log::debug!("Added known address {}", address);
                Ok(true)
            }
        }
    }

    /// Snapshot of the address book
    pub async fn known_addresses(&self) -> HashMap<String, Option<Vec<u8>>> {
        self.shared.known_addresses.read().await.clone()
    }

    pub async fn active_peer_count(&self) -> usize {
        self.shared.active_peers.read().await.len()
    }

    pub async fn active_peer_addresses(&self) -> Vec<String> {
        self.shared.active_peers.read().await.keys().cloned().collect()
    }

    pub async fn active_peers(&self) -> Vec<Arc<Peer>> {
        self.shared.active_peers.read().await.values().cloned().collect()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.shared.server
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.server.local_addr().await
    }

    /// Height advertised to peers in future handshakes
    pub fn set_current_height(&self, height: i64) {
        self.shared.server.set_current_height(height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, JsonCodec, Transaction};
    use crate::network::server::FrameCodec;
    use futures::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, FramedWrite};

    fn test_config(node_id: &str) -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            node_id: node_id.as_bytes().to_vec(),
            discovery_interval: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(3600),
            dial_stagger: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn test_manager(config: NetworkConfig) -> NetworkManager<JsonCodec> {
        NetworkManager::new(config, JsonCodec).unwrap()
    }

    /// A peer backed by a real socket, plus the framed remote end
    async fn test_peer(id: &str) -> (Arc<Peer>, Framed<TcpStream, FrameCodec>) {
        test_peer_at(id, None).await
    }

    async fn test_peer_at(
        id: &str,
        address: Option<&str>,
    ) -> (Arc<Peer>, Framed<TcpStream, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (remote, _) = accepted.unwrap();
        let client = client.unwrap();

        let (_read, write) = client.into_split();
        let peer = Peer::new(
            address.map_or_else(|| addr.to_string(), str::to_string),
            true,
            id.as_bytes().to_vec(),
            FramedWrite::new(write, FrameCodec::default()),
            CancellationToken::new(),
        );
        (Arc::new(peer), Framed::new(remote, FrameCodec::default()))
    }

    async fn next_message(remote: &mut Framed<TcpStream, FrameCodec>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(5), remote.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        Message::from_bytes(&frame).unwrap()
    }

    fn transaction_message(sender: &[u8], tx: &Transaction) -> Message {
        let transaction_data = JsonCodec.encode_transaction(tx).unwrap();
        Message::with_payload(sender.to_vec(), &NewTransactionPayload { transaction_data }).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:3000");
        assert_eq!(config.max_desired_peers, 10);
        assert_eq!(config.stale_after(), Duration::from_secs(45));
        assert_eq!(config.block_buffer, 100);
        assert_eq!(config.transaction_buffer, 1000);
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            NetworkConfig::default().validate(),
            Err(ManagerError::Init(_))
        ));

        let mut config = test_config("node");
        assert!(config.validate().is_ok());

        config.block_buffer = 0;
        assert!(matches!(config.validate(), Err(ManagerError::Init(_))));

        let mut config = test_config("node");
        config.maintenance_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ManagerError::Init(_))));

        let mut config = test_config("node");
        config.bootstrap_peers = vec!["no-port".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ManagerError::InvalidPeerAddress(_))
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_frame_limit_must_fit_length_prefix() {
        let mut config = test_config("node");
        config.max_frame_size = u32::MAX as usize;
        assert!(config.validate().is_ok());

        config.max_frame_size = u32::MAX as usize + 1;
        assert!(matches!(config.validate(), Err(ManagerError::Init(_))));
    }

    #[test]
    fn test_peer_address_format() {
        assert!(is_valid_peer_address("127.0.0.1:3000"));
        assert!(is_valid_peer_address("seed.example.org:3000"));
        assert!(is_valid_peer_address("[::1]:3000"));
        assert!(!is_valid_peer_address("127.0.0.1"));
        assert!(!is_valid_peer_address(":3000"));
        assert!(!is_valid_peer_address("host:99999"));
    }

    #[tokio::test]
    async fn test_new_seeds_bootstrap_peers() {
        let mut config = test_config("node");
        config.bootstrap_peers = vec!["10.0.0.1:3000".into(), "10.0.0.2:3000".into()];
        let manager = test_manager(config);

        let known = manager.known_addresses().await;
        assert_eq!(known.len(), 2);
        assert_eq!(known.get("10.0.0.1:3000"), Some(&None));
        assert_eq!(manager.active_peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let manager = test_manager(test_config("node"));
        assert!(matches!(manager.stop().await, Err(ManagerError::NotRunning)));

        manager.start().await.unwrap();
        assert!(manager.is_running().await);
        assert!(matches!(
            manager.start().await,
            Err(ManagerError::AlreadyRunning)
        ));

        manager.stop().await.unwrap();
        assert!(!manager.is_running().await);
        assert!(matches!(manager.stop().await, Err(ManagerError::NotRunning)));
        assert!(matches!(manager.start().await, Err(ManagerError::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_closes_receivers() {
        let manager = test_manager(test_config("node"));
        let mut blocks = manager.take_block_receiver().unwrap();
        assert!(manager.take_block_receiver().is_none());

        manager.start().await.unwrap();
        manager.stop().await.unwrap();
        assert!(blocks.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_add_known_address() {
        let manager = test_manager(test_config("node"));
        assert!(manager.add_known_address("10.0.0.5:3000", None).await.unwrap());
        assert!(!manager
            .add_known_address("10.0.0.5:3000", Some(b"id5".to_vec()))
            .await
            .unwrap());
        assert_eq!(
            manager.known_addresses().await.get("10.0.0.5:3000"),
            Some(&Some(b"id5".to_vec()))
        );
        assert!(matches!(
            manager.add_known_address("bogus", None).await,
            Err(ManagerError::InvalidPeerAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_routed_to_receiver() {
        let manager = test_manager(test_config("node"));
        let mut txs = manager.take_transaction_receiver().unwrap();
        let (peer, _remote) = test_peer("remote").await;

        let tx = Transaction::new("alice", "bob", 10, 1);
        manager
            .handle_incoming_message(&peer, transaction_message(b"remote", &tx))
            .await;
        assert_eq!(txs.try_recv().unwrap(), tx);
    }

    #[tokio::test]
    async fn test_undecodable_block_is_dropped() {
        let manager = test_manager(test_config("node"));
        let mut blocks = manager.take_block_receiver().unwrap();
        let (peer, _remote) = test_peer("remote").await;

        let bad = Message::with_payload(
            b"remote".to_vec(),
            &NewBlockProposalPayload {
                block_data: b"{not a block".to_vec(),
            },
        )
        .unwrap();
        manager.handle_incoming_message(&peer, bad).await;

        let truncated = Message::new(MessageType::NewBlockProposal, b"remote".to_vec(), vec![9]);
        manager.handle_incoming_message(&peer, truncated).await;

        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_block_channel_drops_without_blocking() {
        let mut config = test_config("node");
        config.block_buffer = 1;
        let manager = test_manager(config);
        let mut blocks = manager.take_block_receiver().unwrap();
        let (peer, _remote) = test_peer("remote").await;

        for height in 1..=3 {
            let block = Block::new(height, "00".repeat(32), "remote".into(), Vec::new());
            let block_data = JsonCodec.encode_block(&block).unwrap();
            let msg = Message::with_payload(
                b"remote".to_vec(),
                &NewBlockProposalPayload { block_data },
            )
            .unwrap();
            tokio::time::timeout(
                Duration::from_secs(1),
                manager.handle_incoming_message(&peer, msg),
            )
            .await
            .expect("dispatch blocked on a full channel");
        }

        assert_eq!(blocks.try_recv().unwrap().height, 1);
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_messages_become_events() {
        let manager = test_manager(test_config("node"));
        let mut sync = manager.take_sync_receiver().unwrap();
        let (peer, _remote) = test_peer("remote").await;

        let request = BlockRequestPayload {
            block_hash: vec![0xab; 32],
            height: 7,
        };
        manager
            .handle_incoming_message(&peer, Message::with_payload(b"remote".to_vec(), &request).unwrap())
            .await;
        match sync.try_recv().unwrap() {
            SyncEvent::BlockRequested {
                peer_id,
                block_hash,
                height,
            } => {
                assert_eq!(peer_id, b"remote".to_vec());
                assert_eq!(block_hash, vec![0xab; 32]);
                assert_eq!(height, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let vote = BlockVotePayload {
            block_hash: vec![1; 32],
            validator: b"remote".to_vec(),
            signature: vec![2; 64],
            is_valid: true,
        };
        manager
            .handle_incoming_message(&peer, Message::with_payload(b"remote".to_vec(), &vote).unwrap())
            .await;
        assert!(matches!(
            sync.try_recv().unwrap(),
            SyncEvent::VoteReceived { vote: v, .. } if v == vote
        ));

        let block = Block::genesis("remote".into());
        let response = BlockResponsePayload {
            block_data: JsonCodec.encode_block(&block).unwrap(),
        };
        manager
            .handle_incoming_message(&peer, Message::with_payload(b"remote".to_vec(), &response).unwrap())
            .await;
        assert!(matches!(
            sync.try_recv().unwrap(),
            SyncEvent::BlockReceived { block: b, .. } if b == block
        ));
    }

    #[tokio::test]
    async fn test_peer_list_merges_valid_addresses() {
        let manager = test_manager(test_config("node"));
        let (peer, _remote) = test_peer("remote").await;

        let list = PeerListPayload {
            peers: vec!["10.0.0.1:3000".into(), "garbage".into(), "10.0.0.2:3000".into()],
        };
        manager
            .handle_incoming_message(&peer, Message::with_payload(b"remote".to_vec(), &list).unwrap())
            .await;

        let known = manager.known_addresses().await;
        assert_eq!(known.len(), 2);
        assert!(known.contains_key("10.0.0.1:3000"));
        assert!(!known.contains_key("garbage"));
    }

    #[tokio::test]
    async fn test_request_peer_list_excludes_requester() {
        let manager = test_manager(test_config("node"));
        let (peer, mut remote) = test_peer("remote").await;
        manager.add_known_address("10.0.0.1:3000", None).await.unwrap();
        manager.add_known_address(peer.address(), None).await.unwrap();

        let request = Message::new(MessageType::RequestPeerList, b"remote".to_vec(), Vec::new());
        manager.handle_incoming_message(&peer, request).await;

        let reply = next_message(&mut remote).await;
        assert_eq!(reply.message_type, MessageType::PeerList);
        assert_eq!(reply.sender_id, b"node".to_vec());
        let list: PeerListPayload = reply.decode_payload().unwrap();
        assert_eq!(list.peers, vec!["10.0.0.1:3000".to_string()]);
    }

    #[tokio::test]
    async fn test_connected_peer_is_tracked_and_asked_for_peers() {
        let manager = test_manager(test_config("node"));
        let (peer, mut remote) = test_peer("remote").await;
        peer.add_known_peer("10.0.0.3:3000");

        manager.shared.handle_peer_connected(Arc::clone(&peer)).await;
        assert_eq!(manager.active_peer_count().await, 1);
        let known = manager.known_addresses().await;
        assert_eq!(known.get(peer.address()), Some(&Some(b"remote".to_vec())));
        assert!(known.contains_key("10.0.0.3:3000"));

        let request = next_message(&mut remote).await;
        assert_eq!(request.message_type, MessageType::RequestPeerList);

        // A different Arc for the same address is not removed
        let (other, _other_remote) = test_peer_at("other", Some(peer.address())).await;
        manager.shared.handle_peer_disconnected(&other).await;
        assert_eq!(manager.active_peer_count().await, 1);

        manager.shared.handle_peer_disconnected(&peer).await;
        assert_eq!(manager.active_peer_count().await, 0);
        // The address book keeps the entry
        assert!(manager.known_addresses().await.contains_key(peer.address()));
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_is_ignored() {
        let manager = test_manager(test_config("node"));
        let (peer, _remote) = test_peer("remote").await;

        // The server removed the peer before its connect event was handled
        peer.close().await.unwrap();
        manager.shared.handle_peer_disconnected(&peer).await;
        manager.shared.handle_peer_connected(Arc::clone(&peer)).await;

        assert_eq!(manager.active_peer_count().await, 0);
        assert!(!manager.known_addresses().await.contains_key(peer.address()));
    }

    #[tokio::test]
    async fn test_prune_stale_connections() {
        let manager = test_manager(test_config("node"));
        let (peer, _remote) = test_peer("remote").await;
        manager.shared.handle_peer_connected(Arc::clone(&peer)).await;

        let now = Instant::now();
        assert_eq!(manager.prune_stale_connections_at(now).await, 0);
        assert_eq!(manager.active_peer_count().await, 1);

        let later = now + manager.config().stale_after() + Duration::from_secs(1);
        assert_eq!(manager.prune_stale_connections_at(later).await, 1);
        assert_eq!(manager.active_peer_count().await, 0);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_targeted_send_to_unknown_peer() {
        let manager = test_manager(test_config("node"));
        let tx = Transaction::new("alice", "bob", 1, 0);
        assert!(matches!(
            manager.send_transaction_to(b"nobody", &tx).await,
            Err(ManagerError::PeerNotFound(_))
        ));
        assert!(matches!(
            manager.request_block_from(b"nobody", Vec::new(), 3).await,
            Err(ManagerError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_targeted_send_reaches_peer() {
        let manager = test_manager(test_config("node"));
        let (peer, mut remote) = test_peer("remote").await;
        manager.shared.handle_peer_connected(Arc::clone(&peer)).await;
        // Drain the RequestPeerList sent on connect
        next_message(&mut remote).await;

        manager
            .request_block_from(b"remote", vec![7; 32], 12)
            .await
            .unwrap();
        let msg = next_message(&mut remote).await;
        assert_eq!(msg.message_type, MessageType::BlockRequest);
        let request: BlockRequestPayload = msg.decode_payload().unwrap();
        assert_eq!(request.height, 12);
    }

    #[tokio::test]
    async fn test_discovery_skips_own_and_active_addresses() {
        let manager = test_manager(test_config("node"));
        let local = manager.start().await.unwrap();

        manager.add_known_address(&local.to_string(), None).await.unwrap();
        assert_eq!(manager.discover_and_connect().await, 0);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_respects_peer_budget() {
        let mut config = test_config("node");
        config.max_desired_peers = 1;
        let manager = test_manager(config);
        let (peer, _remote) = test_peer("remote").await;
        manager.shared.handle_peer_connected(Arc::clone(&peer)).await;
        manager.add_known_address("10.0.0.1:3000", None).await.unwrap();

        assert_eq!(manager.discover_and_connect().await, 0);
    }
}
