use std::sync::Arc;

use btcd_chainstate::blockfiles::BlockFiles;
use btcd_chainstate::state::{Chain, ChainError};
use btcd_chainstate::validation::RejectKind;
use btcd_consensus::money::COIN;
use btcd_consensus::params::{chain_params, ChainParams, Network};
use btcd_consensus::Hash256;
use btcd_pow::check_proof_of_work;
use btcd_primitives::block::{Block, BlockHeader};
use btcd_primitives::encoding::Encoder;
use btcd_primitives::merkle::merkle_root;
use btcd_primitives::outpoint::OutPoint;
use btcd_primitives::transaction::{Transaction, TxIn, TxOut};
use btcd_storage::memory::MemoryStore;

const BASE_TIME: u32 = 1_600_000_000;
// near-limit target so test mining needs only a couple of nonce tries
const TEST_BITS: u32 = 0x2100_7fff;

fn coinbase(height: u32, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![3, height as u8, (height >> 8) as u8, (height >> 16) as u8],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn mine_block(params: &ChainParams, prev: Hash256, time: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
    let (root, _) = merkle_root(&txids);
    let mut header = BlockHeader {
        version: 2,
        prev_block: prev,
        merkle_root: root,
        time,
        bits: TEST_BITS,
        nonce: 0,
    };
    while !check_proof_of_work(&header.hash(), header.bits, &params.consensus) {
        header.nonce += 1;
    }
    let mut raw = header.consensus_encode().to_vec();
    let mut encoder = Encoder::new();
    encoder.write_varint(txs.len() as u64);
    raw.extend_from_slice(&encoder.into_inner());
    for tx in &txs {
        raw.extend_from_slice(&tx.consensus_encode());
    }
    Block::new(raw).expect("mined block parses")
}

fn test_params() -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    let genesis = mine_block(
        &params,
        [0u8; 32],
        BASE_TIME,
        vec![coinbase(0, 50 * COIN)],
    );
    params.consensus.hash_genesis_block = *genesis.hash();
    params.genesis_block = genesis.raw;
    params
}

fn open_chain(dir: &std::path::Path, params: ChainParams) -> Chain<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let blocks = BlockFiles::open(dir, 10_000_000).expect("block files");
    Chain::open(params, store, blocks, false).expect("chain opens")
}

fn block_time(height: u32) -> u32 {
    BASE_TIME + height * 600
}

#[test]
fn linear_acceptance_reaches_height_five() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let mut prev = params.consensus.hash_genesis_block;
    let mut coinbase_outpoints = Vec::new();
    for height in 1..=5u32 {
        let cb = coinbase(height, 50 * COIN);
        coinbase_outpoints.push(OutPoint::new(cb.txid(), 0));
        let mut block = mine_block(&params, prev, block_time(height), vec![cb]);
        prev = *block.hash();
        chain.accept_block(&mut block).expect("block accepted");
        assert_eq!(chain.tip_height(), height);
    }

    let (tip_hash, tip_height) = chain.tip_info();
    assert_eq!(tip_height, 5);
    assert_eq!(tip_hash, prev);

    for outpoint in &coinbase_outpoints {
        let entry = chain
            .utxo_lookup(outpoint)
            .expect("utxo read")
            .expect("coinbase output present");
        assert_eq!(entry.value, 50 * COIN);
        assert!(entry.is_coinbase);
    }
}

#[test]
fn resubmitted_genesis_and_duplicates_are_soft() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let mut genesis = Block::new(params.genesis_block.clone()).unwrap();
    let err = chain.accept_block(&mut genesis).unwrap_err();
    match err {
        ChainError::Reject(reject) => {
            assert_eq!(reject.kind, RejectKind::Genesis);
            assert!(!reject.is_dos());
        }
        other => panic!("unexpected error {other}"),
    }

    let mut block = mine_block(
        &params,
        params.consensus.hash_genesis_block,
        block_time(1),
        vec![coinbase(1, 50 * COIN)],
    );
    let raw = block.raw.clone();
    chain.accept_block(&mut block).expect("first submission");
    let mut again = Block::new(raw).unwrap();
    let err = chain.accept_block(&mut again).unwrap_err();
    match err {
        ChainError::Reject(reject) => {
            assert_eq!(reject.kind, RejectKind::Duplicate);
            assert!(!reject.is_dos());
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn out_of_order_blocks_link_after_retry() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let mut prev = params.consensus.hash_genesis_block;
    let mut blocks = Vec::new();
    for height in 1..=4u32 {
        let block = mine_block(
            &params,
            prev,
            block_time(height),
            vec![coinbase(height, 50 * COIN)],
        );
        prev = *block.hash();
        blocks.push(block);
    }

    // deliver 3, 4, 2, 1: everything except 1 parks until its parent lands
    let mut cache: Vec<Block> = Vec::new();
    for index in [2usize, 3, 1, 0] {
        let mut block = Block::new(blocks[index].raw.clone()).unwrap();
        match chain.accept_block(&mut block) {
            Ok(()) => {}
            Err(ChainError::Reject(reject)) if reject.maybe_later() => cache.push(block),
            Err(other) => panic!("unexpected error {other}"),
        }
        // retry parked blocks the way the main loop drains its cache
        loop {
            let tip_hash = chain.tip_info().0;
            let next = cache
                .iter()
                .position(|cached| cached.header.prev_block == tip_hash);
            let Some(position) = next else { break };
            let mut retry = cache.swap_remove(position);
            chain.accept_block(&mut retry).expect("cached block links");
        }
    }

    assert_eq!(chain.tip_height(), 4);
    assert!(cache.is_empty());
}

#[test]
fn pow_failure_is_a_dos_reject() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let block = mine_block(
        &params,
        params.consensus.hash_genesis_block,
        block_time(1),
        vec![coinbase(1, 50 * COIN)],
    );
    // re-grind the nonce until the hash misses the target
    let mut header = block.header;
    loop {
        header.nonce = header.nonce.wrapping_add(1);
        if !check_proof_of_work(&header.hash(), header.bits, &params.consensus) {
            break;
        }
    }
    let mut raw = block.raw.clone();
    raw[..80].copy_from_slice(&header.consensus_encode());
    let mut bad = Block::new(raw).unwrap();

    let err = chain.accept_block(&mut bad).unwrap_err();
    match err {
        ChainError::Reject(reject) => {
            assert_eq!(reject.rpc_result, "high-hash");
            assert!(reject.is_dos());
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(chain.tip_height(), 0);
}

#[test]
fn stale_timestamp_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let mut block = mine_block(
        &params,
        params.consensus.hash_genesis_block,
        BASE_TIME, // equals the genesis median-time-past
        vec![coinbase(1, 50 * COIN)],
    );
    let err = chain.accept_block(&mut block).unwrap_err();
    match err {
        ChainError::Reject(reject) => assert_eq!(reject.rpc_result, "time-too-old"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn spending_missing_input_deletes_the_branch() {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let chain = open_chain(dir.path(), params.clone());

    let bad_spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x42u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let mut block = mine_block(
        &params,
        params.consensus.hash_genesis_block,
        block_time(1),
        vec![coinbase(1, 50 * COIN), bad_spend],
    );
    let bad_hash = *block.hash();
    let err = chain.accept_block(&mut block).unwrap_err();
    assert!(matches!(err, ChainError::InputMissing(_)));
    assert_eq!(chain.tip_height(), 0);
    {
        let tree = chain.lock_tree();
        assert!(!tree.contains(&bad_hash), "failed branch removed from index");
    }

    // the same height still accepts a valid block afterwards
    let mut good = mine_block(
        &params,
        params.consensus.hash_genesis_block,
        block_time(1) + 1,
        vec![coinbase(1, 50 * COIN)],
    );
    chain.accept_block(&mut good).expect("replacement accepted");
    assert_eq!(chain.tip_height(), 1);
}
