//! Chain types the network layer moves around
//!
//! - Transactions (account transfers identified by content hash)
//! - Blocks (height, parent, proposer, transactions)
//! - The codec seam between payload bytes and those types

pub mod block;
pub mod codec;
pub mod transaction;

pub use block::{Block, GENESIS_PREVIOUS_HASH};
pub use codec::{ChainCodec, CodecError, JsonCodec};
pub use transaction::Transaction;
