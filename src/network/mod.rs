//! P2P Networking module
//!
//! Provides peer-to-peer networking for EmPower1 nodes.
//!
//! # Features
//! - TCP peer connections with length-prefixed framing
//! - Versioned Hello handshake
//! - Peer discovery through exchanged address lists
//! - Liveness pruning of idle peers
//! - Block and transaction gossip
//! - Targeted block, vote and transaction sends

pub mod manager;
pub mod message;
pub mod peer;
pub mod server;

pub use manager::{ManagerError, NetworkConfig, NetworkManager, SyncEvent};
pub use message::{
    BlockRequestPayload, BlockResponsePayload, BlockVotePayload, HelloPayload, Message,
    MessageType, NewBlockProposalPayload, NewTransactionPayload, PeerListPayload, ProtocolError,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use peer::{Peer, PeerError, PeerState};
pub use server::{FrameCodec, HandshakeError, Server, ServerConfig, ServerError, ServerEvent};
