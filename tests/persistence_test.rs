use podoru::chain::Chain;
use podoru::crypto::{Hash, Keypair, Signature};
use podoru::genesis::GenesisConfig;
use podoru::storage::{RocksStorage, Storage};
use podoru::types::{Block, BlockHeader, Operation, Transaction, merkle_root};
use std::fs;
use std::sync::Arc;

fn test_genesis(producer: &Keypair) -> GenesisConfig {
    GenesisConfig {
        timestamp: 1704556800,
        authorities: vec![producer.address()],
        initial_state: [("chain:name".to_string(), "Podoru Chain".to_string())]
            .into_iter()
            .collect(),
        token_config: None,
        gas_config: None,
        initial_balances: Default::default(),
    }
}

fn next_block(chain: &Chain, producer: &Keypair, transactions: Vec<Transaction>) -> Block {
    let tip = chain.get_tip().unwrap();
    let state_root = chain
        .calculate_state_root_with(&transactions, &producer.address())
        .unwrap();
    let mut block = Block {
        header: BlockHeader {
            version: chain.version(),
            height: tip.header.height + 1,
            previous_hash: tip.hash(),
            timestamp: tip.header.timestamp + 1,
            merkle_root: merkle_root(&transactions),
            state_root,
            producer_addr: producer.address(),
            nonce: 0,
        },
        transactions,
        signature: Signature::empty(),
    };
    block.sign(producer).unwrap();
    block
}

#[test]
fn rocksdb_chain_survives_restart() {
    let db_path = "./target/test_db_chain_restart";
    let _ = fs::remove_dir_all(db_path);

    let producer = Keypair::generate();
    let sender = Keypair::generate();
    let genesis = test_genesis(&producer);

    let mut tx = Transaction::new(
        sender.address(),
        1704556900,
        0,
        vec![Operation::Set {
            key: "user:alice:name".into(),
            value: b"Alice".to_vec(),
        }],
    );
    tx.sign(&sender).unwrap();
    let tx_id = tx.compute_id();

    let tip_hash;
    // First run: initialize, commit one block
    {
        let storage = Arc::new(RocksStorage::open(db_path).unwrap());
        let chain = Chain::new(storage, &genesis, Hash::ZERO);
        chain.initialize(&genesis.build_block().unwrap()).unwrap();
        let block = next_block(&chain, &producer, vec![tx]);
        chain.add_block(&block).unwrap();
        tip_hash = block.hash();
    } // chain dropped, db closed

    // Second run: replay from disk
    {
        let storage = Arc::new(RocksStorage::open(db_path).unwrap());
        let chain = Chain::new(storage, &genesis, Hash::ZERO);
        chain.load_from_storage().unwrap();

        assert_eq!(chain.get_height().unwrap(), 1);
        assert_eq!(chain.get_tip().unwrap().hash(), tip_hash);
        assert_eq!(chain.get_state("chain:name"), Some(b"Podoru Chain".to_vec()));
        assert_eq!(chain.get_state("user:alice:name"), Some(b"Alice".to_vec()));
        assert_eq!(chain.get_nonce(&sender.address()), 1);

        let stored_tx = chain.get_transaction_by_hash(&tx_id).unwrap().unwrap();
        assert_eq!(stored_tx.compute_id(), tx_id);
        let by_height = chain.get_block_by_height(1).unwrap().unwrap();
        assert_eq!(by_height.hash(), tip_hash);
        let by_hash = chain.get_block_by_hash(&tip_hash).unwrap().unwrap();
        assert_eq!(by_hash.header.height, 1);
    }

    let _ = fs::remove_dir_all(db_path);
}

#[test]
fn rocksdb_prefix_scan_backs_queries() {
    let db_path = "./target/test_db_prefix_scan";
    let _ = fs::remove_dir_all(db_path);

    let producer = Keypair::generate();
    let sender = Keypair::generate();
    let genesis = test_genesis(&producer);

    {
        let storage = Arc::new(RocksStorage::open(db_path).unwrap());
        let chain = Chain::new(storage.clone(), &genesis, Hash::ZERO);
        chain.initialize(&genesis.build_block().unwrap()).unwrap();

        let mut tx = Transaction::new(
            sender.address(),
            1704556900,
            0,
            vec![
                Operation::Set {
                    key: "user:a".into(),
                    value: b"1".to_vec(),
                },
                Operation::Set {
                    key: "user:b".into(),
                    value: b"2".to_vec(),
                },
                Operation::Set {
                    key: "other:c".into(),
                    value: b"3".to_vec(),
                },
            ],
        );
        tx.sign(&sender).unwrap();
        chain
            .add_block(&next_block(&chain, &producer, vec![tx]))
            .unwrap();

        let hits = chain.query_prefix("user:", 0).unwrap();
        assert_eq!(
            hits.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["user:a", "user:b"]
        );
        let capped = chain.query_prefix("user:", 1).unwrap();
        assert_eq!(capped.len(), 1);

        storage.close().unwrap();
    }

    let _ = fs::remove_dir_all(db_path);
}

#[test]
fn deleted_state_stays_deleted_after_restart() {
    let db_path = "./target/test_db_delete_restart";
    let _ = fs::remove_dir_all(db_path);

    let producer = Keypair::generate();
    let sender = Keypair::generate();
    let genesis = test_genesis(&producer);

    {
        let storage = Arc::new(RocksStorage::open(db_path).unwrap());
        let chain = Chain::new(storage, &genesis, Hash::ZERO);
        chain.initialize(&genesis.build_block().unwrap()).unwrap();

        let mut set = Transaction::new(
            sender.address(),
            1704556900,
            0,
            vec![Operation::Set {
                key: "ephemeral".into(),
                value: b"soon gone".to_vec(),
            }],
        );
        set.sign(&sender).unwrap();
        chain
            .add_block(&next_block(&chain, &producer, vec![set]))
            .unwrap();

        let mut delete = Transaction::new(
            sender.address(),
            1704556901,
            1,
            vec![Operation::Delete {
                key: "ephemeral".into(),
            }],
        );
        delete.sign(&sender).unwrap();
        chain
            .add_block(&next_block(&chain, &producer, vec![delete]))
            .unwrap();
        assert_eq!(chain.get_state("ephemeral"), None);
    }

    {
        let storage = Arc::new(RocksStorage::open(db_path).unwrap());
        let chain = Chain::new(storage.clone(), &genesis, Hash::ZERO);
        chain.load_from_storage().unwrap();
        assert_eq!(chain.get_height().unwrap(), 2);
        assert_eq!(chain.get_state("ephemeral"), None);
        assert_eq!(storage.get_state("ephemeral").unwrap(), None);
    }

    let _ = fs::remove_dir_all(db_path);
}
