//! Transaction type carried over the network
//!
//! An account-style transfer. The ID is the SHA-256 of the transfer fields,
//! so a receiver can check an item was not altered in transit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A value transfer between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hex SHA-256 of the other fields except the signature
    pub id: String,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: DateTime<Utc>,
    /// Hex signature by the sender, checked by the chain layer
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    /// Create an unsigned transaction stamped now
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: u64, fee: u64) -> Self {
        let mut tx = Self {
            id: String::new(),
            from: from.into(),
            to: to.into(),
            amount,
            fee,
            timestamp: Utc::now(),
            signature: String::new(),
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Attach a signature. The ID does not cover it.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.from.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.to.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.amount.to_be_bytes());
        hasher.update(self.fee.to_be_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored ID matches the contents
    pub fn verify_id(&self) -> bool {
        self.id == self.calculate_hash()
    }
}
