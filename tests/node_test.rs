use async_trait::async_trait;
use podoru::config::{NodeConfig, NodeType};
use podoru::crypto::{Hash, Keypair};
use podoru::genesis::GenesisConfig;
use podoru::node::{EventSink, Node, NullEventSink, TxStatus};
use podoru::storage::MemStorage;
use podoru::types::{Block, Operation, Transaction};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn test_genesis(producer: &Keypair) -> GenesisConfig {
    GenesisConfig {
        timestamp: 1704556800,
        authorities: vec![producer.address()],
        initial_state: Default::default(),
        token_config: None,
        gas_config: None,
        initial_balances: Default::default(),
    }
}

fn producer_config(keypair: &Keypair, key_path: &str, bootstrap: Vec<String>) -> NodeConfig {
    fs::create_dir_all("./target").unwrap();
    fs::write(key_path, keypair.to_hex()).unwrap();
    NodeConfig {
        node_type: NodeType::Producer,
        address: Some(keypair.address()),
        private_key: Some(PathBuf::from(key_path)),
        p2p_port: 0,
        p2p_bind_addr: "127.0.0.1".into(),
        bootstrap_peers: bootstrap,
        max_peers: 50,
        api_enabled: false,
        api_bind_addr: "127.0.0.1".into(),
        api_port: 8080,
        data_dir: "./target/node_test_unused".into(),
        genesis_path: "./target/node_test_unused.json".into(),
        authorities: vec![],
        block_time: "1s".into(),
    }
}

fn full_config(bootstrap: Vec<String>) -> NodeConfig {
    NodeConfig {
        node_type: NodeType::Full,
        address: None,
        private_key: None,
        p2p_port: 0,
        p2p_bind_addr: "127.0.0.1".into(),
        bootstrap_peers: bootstrap,
        max_peers: 50,
        api_enabled: false,
        api_bind_addr: "127.0.0.1".into(),
        api_port: 8080,
        data_dir: "./target/node_test_unused".into(),
        genesis_path: "./target/node_test_unused.json".into(),
        authorities: vec![],
        block_time: "1s".into(),
    }
}

fn set_tx(sender: &Keypair, nonce: u64, key: &str, value: &str) -> Transaction {
    let mut tx = Transaction::new(
        sender.address(),
        1704556900,
        nonce,
        vec![Operation::Set {
            key: key.into(),
            value: value.as_bytes().to_vec(),
        }],
    );
    tx.sign(sender).unwrap();
    tx
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct RecordingSink {
    blocks: Mutex<Vec<u64>>,
    transactions: Mutex<Vec<(Hash, TxStatus)>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_new_block(&self, block: &Block) {
        self.blocks.lock().unwrap().push(block.header.height);
    }

    async fn on_new_transaction(&self, tx: &Transaction, status: TxStatus) {
        self.transactions
            .lock()
            .unwrap()
            .push((tx.compute_id(), status));
    }
}

// A lone producer includes a submitted transaction and emits events for the
// admission and the commit.
#[tokio::test]
async fn producer_includes_submitted_transaction() {
    let producer = Keypair::generate();
    let sender = Keypair::generate();
    let genesis = test_genesis(&producer);
    let sink = Arc::new(RecordingSink::default());

    let node = Node::new(
        producer_config(&producer, "./target/node_test_producer.key", vec![]),
        genesis,
        Hash::ZERO,
        Arc::new(MemStorage::new()),
        sink.clone(),
    )
    .unwrap();
    node.start().await.unwrap();

    let tx = set_tx(&sender, 0, "greeting", "hello");
    let tx_id = node.submit_transaction(tx).await.unwrap();
    assert_eq!(node.get_mempool(10).len(), 1);

    let chain = node.chain();
    wait_until(
        "the transaction to land in state",
        Duration::from_secs(15),
        || chain.get_state("greeting") == Some(b"hello".to_vec()),
    )
    .await;

    assert_eq!(chain.get_nonce(&sender.address()), 1);
    // included transactions leave the pool
    assert_eq!(node.get_mempool(10).len(), 0);

    let statuses: Vec<TxStatus> = sink
        .transactions
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == tx_id)
        .map(|(_, status)| *status)
        .collect();
    assert_eq!(statuses, vec![TxStatus::Pending, TxStatus::Confirmed]);
    assert!(!sink.blocks.lock().unwrap().is_empty());

    node.shutdown();
}

// A transaction submitted to a full node travels over gossip, is included
// by the producer, and the resulting block flows back.
#[tokio::test]
async fn transaction_gossip_round_trip() {
    let producer = Keypair::generate();
    let sender = Keypair::generate();
    let genesis = test_genesis(&producer);

    let producing = Node::new(
        producer_config(&producer, "./target/node_test_gossip.key", vec![]),
        genesis.clone(),
        Hash::ZERO,
        Arc::new(MemStorage::new()),
        Arc::new(NullEventSink),
    )
    .unwrap();
    producing.start().await.unwrap();
    let producer_addr = producing.p2p().local_addr().unwrap().to_string();

    let edge = Node::new(
        full_config(vec![producer_addr]),
        genesis,
        Hash::ZERO,
        Arc::new(MemStorage::new()),
        Arc::new(NullEventSink),
    )
    .unwrap();
    edge.start().await.unwrap();

    let tx = set_tx(&sender, 0, "routed:through:gossip", "yes");
    edge.submit_transaction(tx).await.unwrap();

    let edge_chain = edge.chain();
    wait_until(
        "the gossiped transaction to commit on both nodes",
        Duration::from_secs(20),
        || edge_chain.get_state("routed:through:gossip") == Some(b"yes".to_vec()),
    )
    .await;
    assert_eq!(
        producing.chain().get_state("routed:through:gossip"),
        Some(b"yes".to_vec())
    );

    edge.shutdown();
    producing.shutdown();
}

// A producer whose key does not match the configured address refuses to
// start.
#[tokio::test]
async fn producer_key_address_mismatch_rejected() {
    let producer = Keypair::generate();
    let impostor = Keypair::generate();
    let genesis = test_genesis(&producer);

    let mut config = producer_config(&impostor, "./target/node_test_mismatch.key", vec![]);
    config.address = Some(producer.address());

    assert!(
        Node::new(
            config,
            genesis,
            Hash::ZERO,
            Arc::new(MemStorage::new()),
            Arc::new(NullEventSink),
        )
        .is_err()
    );
}
