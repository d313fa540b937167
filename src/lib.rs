//! EmPower1 P2P: the peer-to-peer networking layer of an EmPower1 node
//!
//! This crate provides:
//! - A length-prefixed binary wire protocol with typed payloads
//! - A TCP connection server with a versioned Hello handshake
//! - A network manager for discovery, liveness, routing and gossip
//! - A codec seam through which blocks and transactions reach the chain layer
//!
//! # Example
//!
//! ```no_run
//! use empower1_p2p::core::JsonCodec;
//! use empower1_p2p::network::{NetworkConfig, NetworkManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NetworkConfig {
//!     listen_addr: "0.0.0.0:3000".to_string(),
//!     node_id: b"validator-1".to_vec(),
//!     bootstrap_peers: vec!["seed.example.org:3000".to_string()],
//!     ..Default::default()
//! };
//! let manager = NetworkManager::new(config, JsonCodec)?;
//! let mut blocks = manager.take_block_receiver().unwrap();
//! manager.start().await?;
//!
//! while let Some(block) = blocks.recv().await {
//!     println!("block {} at height {}", block.hash, block.height);
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod network;

pub use core::{Block, ChainCodec, JsonCodec, Transaction};
pub use network::{NetworkConfig, NetworkManager, Server, ServerConfig};
