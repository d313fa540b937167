//! Multi-node scenarios over loopback TCP

use bytes::Bytes;
use empower1_p2p::core::{Block, ChainCodec, JsonCodec, Transaction};
use empower1_p2p::network::{
    FrameCodec, HelloPayload, Message, MessageType, NetworkConfig, NetworkManager,
    NewBlockProposalPayload, NewTransactionPayload, SyncEvent,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

fn config(node_id: &str, bootstrap: Vec<String>) -> NetworkConfig {
    NetworkConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        node_id: node_id.as_bytes().to_vec(),
        bootstrap_peers: bootstrap,
        discovery_interval: Duration::from_secs(3600),
        maintenance_interval: Duration::from_secs(3600),
        dial_stagger: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn start_node(
    node_id: &str,
    bootstrap: Vec<String>,
) -> (NetworkManager<JsonCodec>, SocketAddr) {
    start_with(config(node_id, bootstrap)).await
}

async fn start_with(config: NetworkConfig) -> (NetworkManager<JsonCodec>, SocketAddr) {
    let manager = NetworkManager::new(config, JsonCodec).unwrap();
    let addr = manager.start().await.unwrap();
    (manager, addr)
}

async fn wait_for_active(manager: &NetworkManager<JsonCodec>, expected: usize) {
    for _ in 0..200 {
        if manager.active_peer_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "expected {} active peers, have {}",
        expected,
        manager.active_peer_count().await
    );
}

async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

fn hello(version: &str, node_id: &[u8]) -> Bytes {
    let mut payload = HelloPayload::new("127.0.0.1:1".to_string(), node_id.to_vec(), Vec::new(), 0);
    payload.version = version.to_string();
    let msg = Message::with_payload(node_id.to_vec(), &payload).unwrap();
    Bytes::from(msg.to_bytes().unwrap())
}

/// Connect a hand-driven client and complete the handshake with `addr`
async fn raw_peer(addr: SocketAddr, node_id: &[u8]) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed.send(hello("empower1/0.1", node_id)).await.unwrap();

    let reply = tokio::time::timeout(WAIT, framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply = Message::from_bytes(&reply).unwrap();
    assert_eq!(reply.message_type, MessageType::Hello);
    framed
}

fn transaction_frame(sender: &[u8], tx: &Transaction) -> Bytes {
    let transaction_data = JsonCodec.encode_transaction(tx).unwrap();
    let msg =
        Message::with_payload(sender.to_vec(), &NewTransactionPayload { transaction_data }).unwrap();
    Bytes::from(msg.to_bytes().unwrap())
}

#[tokio::test]
async fn test_two_nodes_handshake() {
    let (a, a_addr) = start_node("node-a", Vec::new()).await;
    let (b, _) = start_node("node-b", vec![a_addr.to_string()]).await;

    wait_for_active(&a, 1).await;
    wait_for_active(&b, 1).await;

    let b_sees = b.active_peers().await;
    assert_eq!(b_sees[0].id(), b"node-a".to_vec());
    assert!(b_sees[0].is_initiator());
    let a_sees = a.active_peers().await;
    assert_eq!(a_sees[0].id(), b"node-b".to_vec());
    assert!(!a_sees[0].is_initiator());

    // A learned B's listening address and identity from the Hello
    let b_listen = b.local_addr().await.unwrap().to_string();
    assert_eq!(
        a.known_addresses().await.get(&b_listen),
        Some(&Some(b"node-b".to_vec()))
    );

    b.stop().await.unwrap();
    wait_for_active(&a, 0).await;
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_transaction_does_not_kill_connection() {
    let (a, a_addr) = start_node("node-a", Vec::new()).await;
    let mut txs = a.take_transaction_receiver().unwrap();
    let mut client = raw_peer(a_addr, b"raw").await;
    wait_for_active(&a, 1).await;

    let truncated = Message::new(MessageType::NewTransaction, b"raw".to_vec(), vec![1, 2]);
    client
        .send(Bytes::from(truncated.to_bytes().unwrap()))
        .await
        .unwrap();

    let tx = Transaction::new("alice", "bob", 25, 1);
    client.send(transaction_frame(b"raw", &tx)).await.unwrap();

    assert_eq!(recv(&mut txs).await, tx);
    assert_eq!(a.active_peer_count().await, 1);
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_block_channel_keeps_connection_alive() {
    let mut cfg = config("node-a", Vec::new());
    cfg.block_buffer = 1;
    let (a, a_addr) = start_with(cfg).await;
    let mut blocks = a.take_block_receiver().unwrap();
    let mut txs = a.take_transaction_receiver().unwrap();
    let mut client = raw_peer(a_addr, b"raw").await;
    wait_for_active(&a, 1).await;

    for height in 1..=5 {
        let block = Block::new(height, "00".repeat(32), "raw".into(), Vec::new());
        let block_data = JsonCodec.encode_block(&block).unwrap();
        let msg =
            Message::with_payload(b"raw".to_vec(), &NewBlockProposalPayload { block_data }).unwrap();
        client.send(Bytes::from(msg.to_bytes().unwrap())).await.unwrap();
    }
    let tx = Transaction::new("alice", "bob", 1, 0);
    client.send(transaction_frame(b"raw", &tx)).await.unwrap();

    // The transaction behind the overflow still arrives
    assert_eq!(recv(&mut txs).await, tx);
    assert_eq!(a.active_peer_count().await, 1);
    assert_eq!(recv(&mut blocks).await.height, 1);
    assert!(blocks.try_recv().is_err());
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let (a, a_addr) = start_node("node-a", Vec::new()).await;

    let stream = TcpStream::connect(a_addr).await.unwrap();
    let mut client = Framed::new(stream, FrameCodec::default());
    client.send(hello("bitcoin/70015", b"stranger")).await.unwrap();

    // The connection is closed without a Hello in return
    let next = tokio::time::timeout(WAIT, client.next()).await.unwrap();
    assert!(!matches!(next, Some(Ok(_))));
    assert_eq!(a.active_peer_count().await, 0);
    assert_eq!(a.server().peer_count().await, 0);
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_transaction_gossips_across_line() {
    let (a, a_addr) = start_node("node-a", Vec::new()).await;
    let (b, b_addr) = start_node("node-b", vec![a_addr.to_string()]).await;
    wait_for_active(&a, 1).await;
    let (c, _) = start_node("node-c", vec![b_addr.to_string()]).await;
    wait_for_active(&b, 2).await;
    wait_for_active(&c, 1).await;

    let mut b_txs = b.take_transaction_receiver().unwrap();
    let mut c_txs = c.take_transaction_receiver().unwrap();

    let tx = Transaction::new("alice", "carol", 40, 2);
    assert_eq!(a.broadcast_transaction(&tx).await.unwrap(), 1);

    assert_eq!(recv(&mut b_txs).await, tx);
    assert_eq!(recv(&mut c_txs).await, tx);

    for node in [&c, &b, &a] {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_block_request_and_response() {
    let (a, a_addr) = start_node("node-a", Vec::new()).await;
    let (b, _) = start_node("node-b", vec![a_addr.to_string()]).await;
    wait_for_active(&a, 1).await;
    wait_for_active(&b, 1).await;

    let mut a_sync = a.take_sync_receiver().unwrap();
    let mut b_sync = b.take_sync_receiver().unwrap();

    let genesis = Block::genesis("node-a".to_string());
    b.request_block_from(b"node-a", genesis.hash_bytes(), 0)
        .await
        .unwrap();

    match recv(&mut a_sync).await {
        SyncEvent::BlockRequested {
            peer_id,
            block_hash,
            height,
        } => {
            assert_eq!(peer_id, b"node-b".to_vec());
            assert_eq!(block_hash, genesis.hash_bytes());
            assert_eq!(height, 0);
            a.send_block_to(&peer_id, &genesis).await.unwrap();
        }
        other => panic!("unexpected sync event {:?}", other),
    }

    match recv(&mut b_sync).await {
        SyncEvent::BlockReceived { peer_id, block } => {
            assert_eq!(peer_id, b"node-a".to_vec());
            assert_eq!(block, genesis);
        }
        other => panic!("unexpected sync event {:?}", other),
    }

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}
