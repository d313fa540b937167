//! EmPower1 P2P daemon
//!
//! Runs the networking layer of a node on its own: joins the network, keeps
//! peers connected and logs the blocks, transactions and sync traffic it sees.

use clap::{Parser, Subcommand};
use empower1_p2p::core::{JsonCodec, Transaction};
use empower1_p2p::network::{NetworkConfig, NetworkManager, SyncEvent};
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "empower1-p2pd")]
#[command(author = "EmPower1 Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking daemon for EmPower1 nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and stay connected until Ctrl+C
    Start {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:3000")]
        listen: String,

        /// Node ID as hex (random if omitted)
        #[arg(short, long)]
        node_id: Option<String>,

        /// Bootstrap peer, host:port (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<String>,

        /// Number of peers discovery aims for
        #[arg(short, long, default_value = "10")]
        max_peers: usize,

        /// Seconds between discovery rounds
        #[arg(long, default_value = "30")]
        discovery_secs: u64,
    },

    /// Connect to a peer, hand it one transaction and exit
    Submit {
        /// Peer to submit to, host:port
        #[arg(short, long)]
        peer: String,

        /// Sender address
        #[arg(short, long)]
        from: String,

        /// Recipient address
        #[arg(short, long)]
        to: String,

        /// Amount to transfer
        #[arg(short, long)]
        amount: u64,

        /// Fee offered
        #[arg(long, default_value = "0")]
        fee: u64,
    },
}

fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cli.command {
            Commands::Start {
                listen,
                node_id,
                peers,
                max_peers,
                discovery_secs,
            } => {
                let config = NetworkConfig {
                    listen_addr: listen,
                    node_id: parse_node_id(node_id.as_deref())?,
                    bootstrap_peers: peers,
                    max_desired_peers: max_peers,
                    discovery_interval: Duration::from_secs(discovery_secs.max(1)),
                    ..Default::default()
                };
                run_node(config).await
            }

            Commands::Submit {
                peer,
                from,
                to,
                amount,
                fee,
            } => {
                let tx = Transaction::new(from, to, amount, fee);
                submit_transaction(&peer, tx).await
            }
        }
    })
}

/// Decode a hex node ID, or make up a random one
fn parse_node_id(node_id: Option<&str>) -> Result<Vec<u8>, BoxError> {
    match node_id {
        Some(hex_id) => {
            let id = hex::decode(hex_id)?;
            if id.is_empty() {
                return Err("node ID must not be empty".into());
            }
            Ok(id)
        }
        None => Ok(rand::random::<[u8; 16]>().to_vec()),
    }
}

async fn run_node(config: NetworkConfig) -> Result<(), BoxError> {
    let manager = NetworkManager::new(config, JsonCodec)?;
    let mut blocks = manager
        .take_block_receiver()
        .ok_or("block receiver already taken")?;
    let mut transactions = manager
        .take_transaction_receiver()
        .ok_or("transaction receiver already taken")?;
    let mut sync = manager
        .take_sync_receiver()
        .ok_or("sync receiver already taken")?;

    let local_addr = manager.start().await?;
    println!(
        "Node {} listening on {}",
        hex::encode(manager.node_id()),
        local_addr
    );

    loop {
        tokio::select! {
            Some(block) = blocks.recv() => {
                log::info!(
                    "Block {} at height {} from proposer {} ({} transactions)",
                    block.hash,
                    block.height,
                    block.proposer,
                    block.transactions.len()
                );
                let height = i64::try_from(block.height).unwrap_or(i64::MAX);
                manager.set_current_height(height);
            }
            Some(tx) = transactions.recv() => {
                log::info!(
                    "Transaction {}: {} -> {} amount {} fee {}",
                    tx.id, tx.from, tx.to, tx.amount, tx.fee
                );
            }
            Some(event) = sync.recv() => match event {
                SyncEvent::BlockRequested { peer_id, block_hash, height } => {
                    // No chain store behind the daemon, so requests go unanswered
                    log::info!(
                        "Peer {} requested block {} (height {})",
                        hex::encode(peer_id),
                        hex::encode(block_hash),
                        height
                    );
                }
                SyncEvent::BlockReceived { peer_id, block } => {
                    log::info!("Peer {} sent block {}", hex::encode(peer_id), block.hash);
                }
                SyncEvent::VoteReceived { peer_id, vote } => {
                    log::info!(
                        "Validator {} voted {} on block {} (via {})",
                        hex::encode(&vote.validator),
                        if vote.is_valid { "valid" } else { "invalid" },
                        hex::encode(&vote.block_hash),
                        hex::encode(peer_id)
                    );
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down node...");
                break;
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

async fn submit_transaction(peer: &str, tx: Transaction) -> Result<(), BoxError> {
    let config = NetworkConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        node_id: parse_node_id(None)?,
        bootstrap_peers: vec![peer.to_string()],
        max_desired_peers: 1,
        ..Default::default()
    };
    let manager = NetworkManager::new(config, JsonCodec)?;
    manager.start().await?;

    let mut target = None;
    for _ in 0..100 {
        if let Some(active) = manager.active_peers().await.into_iter().next() {
            target = Some(active);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let result = match target {
        Some(target) => manager
            .send_transaction_to(&target.id(), &tx)
            .await
            .map_err(BoxError::from),
        None => Err(format!("could not connect to {}", peer).into()),
    };
    manager.stop().await?;

    result?;
    println!("Submitted transaction {} to {}", tx.id, peer);
    Ok(())
}
