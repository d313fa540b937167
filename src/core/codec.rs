//! Conversion between chain items and the bytes carried in message payloads
//!
//! The network layer never interprets blocks or transactions itself. It hands
//! payload bytes to a [`ChainCodec`] and delivers whatever comes back.

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Decodes and encodes the chain's block and transaction types
pub trait ChainCodec: Send + Sync + 'static {
    type Block: Send + 'static;
    type Transaction: Send + 'static;

    fn decode_block(&self, data: &[u8]) -> Result<Self::Block, CodecError>;
    fn encode_block(&self, block: &Self::Block) -> Result<Vec<u8>, CodecError>;
    fn decode_transaction(&self, data: &[u8]) -> Result<Self::Transaction, CodecError>;
    fn encode_transaction(&self, tx: &Self::Transaction) -> Result<Vec<u8>, CodecError>;
}

/// JSON encoding of [`Block`] and [`Transaction`].
///
/// Decoding recomputes hashes and rejects items whose stored hash or ID
/// does not match.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ChainCodec for JsonCodec {
    type Block = Block;
    type Transaction = Transaction;

    fn decode_block(&self, data: &[u8]) -> Result<Block, CodecError> {
        let block: Block = serde_json::from_slice(data)?;
        if !block.verify() {
            return Err(CodecError::InvalidData(format!(
                "block {} at height {} does not match its contents",
                block.hash, block.height
            )));
        }
        Ok(block)
    }

    fn encode_block(&self, block: &Block) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(block)?)
    }

    fn decode_transaction(&self, data: &[u8]) -> Result<Transaction, CodecError> {
        let tx: Transaction = serde_json::from_slice(data)?;
        if !tx.verify_id() {
            return Err(CodecError::InvalidData(format!(
                "transaction {} does not match its contents",
                tx.id
            )));
        }
        Ok(tx)
    }

    fn encode_transaction(&self, tx: &Transaction) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(tx)?)
    }
}
