//! Network message types for P2P communication
//!
//! Defines the message envelope exchanged between peers, the payload carried by
//! each message type, and their binary encodings.
//!
//! Envelope layout (all integers big-endian):
//!
//! ```text
//! [type u8][timestamp i64][sender_len u32][sender][payload_len u32][payload]
//! ```
//!
//! Payloads are opaque to the envelope and encoded separately with `bincode`,
//! so a payload can evolve without touching the frame.

use bytes::{Buf, BufMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version advertised in Hello
pub const PROTOCOL_VERSION: &str = "empower1/0.1";

/// Version prefix a remote peer must share to be admitted
pub const PROTOCOL_FAMILY: &str = "empower1/";

/// Maximum encoded size of a single message (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Fixed part of the envelope: type + timestamp + two length fields
const ENVELOPE_HEADER_SIZE: usize = 1 + 8 + 4 + 4;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message truncated: {field} needs {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("Message has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("Message missing sender ID")]
    MissingSenderId,
    #[error("Field {field} too large: {len} bytes")]
    Oversized { field: &'static str, len: usize },
    #[error("Failed to encode {shape} payload: {source}")]
    PayloadEncoding {
        shape: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("Failed to decode {shape} payload: {source}")]
    PayloadDecoding {
        shape: &'static str,
        #[source]
        source: bincode::Error,
    },
}

/// Message types with stable wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Handshake, sent once in each direction when a connection opens
    Hello,
    /// Known peer addresses
    PeerList,
    /// Ask a peer for its known addresses
    RequestPeerList,
    /// A proposed block
    NewBlockProposal,
    /// A validator's vote on a block
    BlockVote,
    /// Request a block by hash or height
    BlockRequest,
    /// Answer to a BlockRequest
    BlockResponse,
    /// A new transaction
    NewTransaction,
    /// Reserved: audit log propagation
    AuditLog,
    /// Reserved: wealth level updates
    WealthUpdate,
    /// Tag this node does not know about
    Unknown(u8),
}

impl MessageType {
    /// Wire tag for this type
    pub fn tag(self) -> u8 {
        match self {
            MessageType::Hello => 0,
            MessageType::PeerList => 1,
            MessageType::RequestPeerList => 2,
            MessageType::NewBlockProposal => 3,
            MessageType::BlockVote => 4,
            MessageType::BlockRequest => 5,
            MessageType::BlockResponse => 6,
            MessageType::NewTransaction => 7,
            MessageType::AuditLog => 8,
            MessageType::WealthUpdate => 9,
            MessageType::Unknown(tag) => tag,
        }
    }

    /// Map a wire tag back to a type. Unrecognized tags are preserved.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => MessageType::Hello,
            1 => MessageType::PeerList,
            2 => MessageType::RequestPeerList,
            3 => MessageType::NewBlockProposal,
            4 => MessageType::BlockVote,
            5 => MessageType::BlockRequest,
            6 => MessageType::BlockResponse,
            7 => MessageType::NewTransaction,
            8 => MessageType::AuditLog,
            9 => MessageType::WealthUpdate,
            other => MessageType::Unknown(other),
        }
    }

    /// Stable human-readable label for logging
    pub fn describe(self) -> String {
        let label = match self {
            MessageType::Hello => "HELLO",
            MessageType::PeerList => "PEER_LIST",
            MessageType::RequestPeerList => "REQUEST_PEER_LIST",
            MessageType::NewBlockProposal => "NEW_BLOCK_PROPOSAL",
            MessageType::BlockVote => "BLOCK_VOTE",
            MessageType::BlockRequest => "BLOCK_REQUEST",
            MessageType::BlockResponse => "BLOCK_RESPONSE",
            MessageType::NewTransaction => "NEW_TRANSACTION",
            MessageType::AuditLog => "AUDIT_LOG",
            MessageType::WealthUpdate => "WEALTH_UPDATE",
            MessageType::Unknown(tag) => return format!("UNKNOWN_MSG_TYPE({})", tag),
        };
        label.to_string()
    }
}

impl From<u8> for MessageType {
    fn from(tag: u8) -> Self {
        MessageType::from_tag(tag)
    }
}

impl From<MessageType> for u8 {
    fn from(message_type: MessageType) -> Self {
        message_type.tag()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// The unit of exchange between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    /// Creation time in Unix nanoseconds, as claimed by the sender
    pub timestamp: i64,
    pub sender_id: Vec<u8>,
    /// Type-specific encoded payload
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(message_type: MessageType, sender_id: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            timestamp: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default(),
            sender_id,
            payload,
        }
    }

    /// Create a message whose type and payload come from a typed payload
    pub fn with_payload<P: Payload>(sender_id: Vec<u8>, payload: &P) -> Result<Self, ProtocolError> {
        Ok(Self::new(P::MESSAGE_TYPE, sender_id, encode_payload(payload)?))
    }

    /// Decode this message's payload into the expected shape
    pub fn decode_payload<P: Payload>(&self) -> Result<P, ProtocolError> {
        decode_payload(&self.payload)
    }

    /// Serialize the envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let sender_len = checked_len("sender_id", self.sender_id.len())?;
        let payload_len = checked_len("payload", self.payload.len())?;
        let total = ENVELOPE_HEADER_SIZE + self.sender_id.len() + self.payload.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::Oversized {
                field: "message",
                len: total,
            });
        }

        let mut buf = Vec::with_capacity(total);
        buf.put_u8(self.message_type.tag());
        buf.put_i64(self.timestamp);
        buf.put_u32(sender_len);
        buf.put_slice(&self.sender_id);
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Deserialize an envelope, rejecting malformed frames and empty sender IDs.
    ///
    /// The payload is not inspected; see [`Message::decode_payload`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;

        ensure_remaining(&buf, 1, "type")?;
        let message_type = MessageType::from_tag(buf.get_u8());

        ensure_remaining(&buf, 8, "timestamp")?;
        let timestamp = buf.get_i64();

        ensure_remaining(&buf, 4, "sender_len")?;
        let sender_len = buf.get_u32() as usize;
        let sender_id = take_bytes(&mut buf, sender_len, "sender_id")?;

        ensure_remaining(&buf, 4, "payload_len")?;
        let payload_len = buf.get_u32() as usize;
        let payload = take_bytes(&mut buf, payload_len, "payload")?;

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }
        if sender_id.is_empty() {
            return Err(ProtocolError::MissingSenderId);
        }

        Ok(Self {
            message_type,
            timestamp,
            sender_id,
            payload,
        })
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> String {
        self.message_type.describe()
    }
}

fn checked_len(field: &'static str, len: usize) -> Result<u32, ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversized { field, len });
    }
    u32::try_from(len).map_err(|_| ProtocolError::Oversized { field, len })
}

fn ensure_remaining(buf: &&[u8], needed: usize, field: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_bytes(buf: &mut &[u8], len: usize, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    ensure_remaining(buf, len, field)?;
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head.to_vec())
}

// =============================================================================
// Payloads
// =============================================================================

/// A typed payload carried inside a [`Message`]
pub trait Payload: Serialize + DeserializeOwned {
    /// Name used in error messages
    const SHAPE: &'static str;
    /// Message type this payload travels under
    const MESSAGE_TYPE: MessageType;
}

/// Encode any payload struct for inclusion in a message
pub fn encode_payload<P: Payload>(payload: &P) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(payload).map_err(|source| ProtocolError::PayloadEncoding {
        shape: P::SHAPE,
        source,
    })
}

/// Decode raw payload bytes into the expected payload shape
pub fn decode_payload<P: Payload>(data: &[u8]) -> Result<P, ProtocolError> {
    bincode::deserialize(data).map_err(|source| ProtocolError::PayloadDecoding {
        shape: P::SHAPE,
        source,
    })
}

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Protocol version, e.g. "empower1/0.1"
    pub version: String,
    /// Address the sender accepts connections on
    pub listen_addr: String,
    /// Sender's node ID (asserted, not verified)
    pub node_id: Vec<u8>,
    /// Addresses of peers the sender knows
    pub known_peers: Vec<String>,
    /// Sender's chain height
    pub current_height: i64,
}

impl HelloPayload {
    /// Create a Hello for the current protocol version
    pub fn new(
        listen_addr: String,
        node_id: Vec<u8>,
        known_peers: Vec<String>,
        current_height: i64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            listen_addr,
            node_id,
            known_peers,
            current_height,
        }
    }

    /// Check protocol family and node ID
    pub fn validate(&self, family: &str) -> Result<(), HelloRejection> {
        if !self.version.starts_with(family) {
            return Err(HelloRejection::IncompatibleVersion(self.version.clone()));
        }
        if self.node_id.is_empty() {
            return Err(HelloRejection::MissingNodeId);
        }
        Ok(())
    }
}

/// Reasons a Hello is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HelloRejection {
    #[error("Incompatible protocol version '{0}'")]
    IncompatibleVersion(String),
    #[error("Hello missing node ID")]
    MissingNodeId,
}

impl Payload for HelloPayload {
    const SHAPE: &'static str = "HelloPayload";
    const MESSAGE_TYPE: MessageType = MessageType::Hello;
}

/// Peer addresses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<String>,
}

impl Payload for PeerListPayload {
    const SHAPE: &'static str = "PeerListPayload";
    const MESSAGE_TYPE: MessageType = MessageType::PeerList;
}

/// A serialized block being proposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockProposalPayload {
    pub block_data: Vec<u8>,
}

impl Payload for NewBlockProposalPayload {
    const SHAPE: &'static str = "NewBlockProposalPayload";
    const MESSAGE_TYPE: MessageType = MessageType::NewBlockProposal;
}

/// A validator's vote on a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVotePayload {
    pub block_hash: Vec<u8>,
    pub validator: Vec<u8>,
    pub signature: Vec<u8>,
    pub is_valid: bool,
}

impl Payload for BlockVotePayload {
    const SHAPE: &'static str = "BlockVotePayload";
    const MESSAGE_TYPE: MessageType = MessageType::BlockVote;
}

/// A serialized transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransactionPayload {
    pub transaction_data: Vec<u8>,
}

impl Payload for NewTransactionPayload {
    const SHAPE: &'static str = "NewTransactionPayload";
    const MESSAGE_TYPE: MessageType = MessageType::NewTransaction;
}

/// Request a block by hash, or by height when the hash is empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequestPayload {
    pub block_hash: Vec<u8>,
    pub height: i64,
}

impl Payload for BlockRequestPayload {
    const SHAPE: &'static str = "BlockRequestPayload";
    const MESSAGE_TYPE: MessageType = MessageType::BlockRequest;
}

/// A serialized block answering a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponsePayload {
    pub block_data: Vec<u8>,
}

impl Payload for BlockResponsePayload {
    const SHAPE: &'static str = "BlockResponsePayload";
    const MESSAGE_TYPE: MessageType = MessageType::BlockResponse;
}
