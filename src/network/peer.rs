//! Peer state for P2P networking
//!
//! A [`Peer`] owns the write half of one TCP connection plus the protocol
//! state learned about the remote node. The read half belongs to the
//! connection's read loop in [`crate::network::server`].

use crate::network::message::HelloPayload;
use crate::network::server::FrameCodec;
use bytes::Bytes;
use futures::sink::SinkExt;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// How long `close` waits to flush buffered bytes before dropping them
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Framed write half of a peer connection
pub type PeerWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer connection closed")]
    Closed,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

struct PeerInfo {
    id: Vec<u8>,
    state: PeerState,
    known_peers: HashSet<String>,
    last_activity: Instant,
    listen_addr: Option<String>,
    current_height: i64,
}

/// One remote node and its connection
pub struct Peer {
    address: String,
    is_initiator: bool,
    info: RwLock<PeerInfo>,
    writer: Mutex<Option<PeerWriter>>,
    closing: CancellationToken,
}

impl Peer {
    /// Wrap a freshly established connection.
    ///
    /// `closing` is cancelled when the peer closes; pass a child of the
    /// server's shutdown token so a server stop reaches every peer.
    pub fn new(
        address: String,
        is_initiator: bool,
        id: Vec<u8>,
        writer: PeerWriter,
        closing: CancellationToken,
    ) -> Self {
        Self {
            address,
            is_initiator,
            info: RwLock::new(PeerInfo {
                id,
                state: PeerState::Connecting,
                known_peers: HashSet::new(),
                last_activity: Instant::now(),
                listen_addr: None,
                current_height: 0,
            }),
            writer: Mutex::new(Some(writer)),
            closing,
        }
    }

    fn read_info(&self) -> RwLockReadGuard<'_, PeerInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_info(&self) -> RwLockWriteGuard<'_, PeerInfo> {
        self.info.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Node ID, as asserted by the remote in its Hello once the handshake ran
    pub fn id(&self) -> Vec<u8> {
        self.read_info().id.clone()
    }

    /// Node ID as hex, for logs
    pub fn id_hex(&self) -> String {
        hex::encode(&self.read_info().id)
    }

    /// Remote endpoint, the peer's key in every table
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether we dialed this peer
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn state(&self) -> PeerState {
        self.read_info().state
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        let mut info = self.write_info();
        if info.state != PeerState::Closed {
            info.state = state;
        }
    }

    /// Mark that a message was just received
    pub fn record_activity(&self) {
        self.write_info().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.read_info().last_activity
    }

    /// Address the remote accepts connections on, from its Hello
    pub fn listen_addr(&self) -> Option<String> {
        self.read_info().listen_addr.clone()
    }

    /// Chain height the remote advertised
    pub fn current_height(&self) -> i64 {
        self.read_info().current_height
    }

    /// Remember an address this peer advertised
    pub fn add_known_peer(&self, address: impl Into<String>) {
        self.write_info().known_peers.insert(address.into());
    }

    /// Copy of the addresses this peer advertised
    pub fn known_peers(&self) -> HashSet<String> {
        self.read_info().known_peers.clone()
    }

    pub fn has_known_peer(&self, address: &str) -> bool {
        self.read_info().known_peers.contains(address)
    }

    /// Take identity and advertised addresses from a Hello
    pub(crate) fn apply_hello(&self, hello: &HelloPayload) {
        let mut info = self.write_info();
        if !hello.node_id.is_empty() {
            info.id = hello.node_id.clone();
        }
        if !hello.listen_addr.is_empty() {
            info.known_peers.insert(hello.listen_addr.clone());
            info.listen_addr = Some(hello.listen_addr.clone());
        }
        info.known_peers.extend(hello.known_peers.iter().cloned());
        info.current_height = hello.current_height;
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once the peer starts closing
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Write one frame body and flush. Writes to the same peer are serialized.
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<(), PeerError> {
        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.closing.cancelled() => return Err(PeerError::Closed),
        };
        let writer = writer.as_mut().ok_or(PeerError::Closed)?;

        tokio::select! {
            result = writer.send(frame) => result.map_err(PeerError::IoError),
            _ = self.closing.cancelled() => Err(PeerError::Closed),
        }
    }

    /// Close the connection. Only the first call does any work.
    ///
    /// Buffered bytes get [`CLOSE_FLUSH_TIMEOUT`] to drain; a remote that
    /// stopped reading cannot hold the close up past that.
    pub async fn close(&self) -> Result<(), PeerError> {
        self.closing.cancel();

        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return Ok(());
        };

        self.write_info().state = PeerState::Closed;
        log::debug!("Closing connection to {}", self.address);
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => Ok(()),
            // The remote may already have hung up
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(PeerError::IoError(e)),
            Err(_) => {
                log::debug!(
                    "Dropping {} unflushed bytes to {}",
                    writer.write_buffer().len(),
                    self.address
                );
                // Dropping the write half shuts the socket down without flushing
                drop(writer);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("id", &self.id_hex())
            .field("initiator", &self.is_initiator)
            .field("state", &self.state())
            .finish()
    }
}
