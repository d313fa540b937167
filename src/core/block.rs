//! Block type carried over the network
//!
//! A block commits to its height, parent, proposer and the IDs of its
//! transactions. The hash is double SHA-256 over those fields.

use crate::core::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Parent hash of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A proposed or finalized block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    /// Hex hash of the parent block
    pub previous_hash: String,
    /// Node ID of the validator that proposed the block, hex encoded
    pub proposer: String,
    pub transactions: Vec<Transaction>,
    /// Hex hash of this block (cached)
    pub hash: String,
}

impl Block {
    /// Create a block on top of `previous_hash`
    pub fn new(
        height: u64,
        previous_hash: String,
        proposer: String,
        transactions: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            height,
            timestamp: Utc::now(),
            previous_hash,
            proposer,
            transactions,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Create the genesis block
    pub fn genesis(proposer: String) -> Self {
        Self::new(0, GENESIS_PREVIOUS_HASH.to_string(), proposer, Vec::new())
    }

    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_be_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.proposer.as_bytes());
        hasher.update([0u8]);
        for tx in &self.transactions {
            hasher.update(tx.id.as_bytes());
        }
        let first = hasher.finalize();
        hex::encode(Sha256::digest(first))
    }

    /// Hash bytes, as carried in votes and block requests
    pub fn hash_bytes(&self) -> Vec<u8> {
        hex::decode(&self.hash).unwrap_or_default()
    }

    /// Whether the cached hash and every transaction ID match the contents
    pub fn verify(&self) -> bool {
        self.hash == self.calculate_hash() && self.transactions.iter().all(Transaction::verify_id)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }
}
