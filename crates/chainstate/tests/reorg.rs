use std::sync::Arc;

use btcd_chainstate::blockfiles::BlockFiles;
use btcd_chainstate::state::Chain;
use btcd_consensus::money::COIN;
use btcd_consensus::params::{chain_params, ChainParams, Network};
use btcd_consensus::Hash256;
use btcd_pow::check_proof_of_work;
use btcd_primitives::block::{Block, BlockHeader};
use btcd_primitives::encoding::Encoder;
use btcd_primitives::merkle::merkle_root;
use btcd_primitives::outpoint::OutPoint;
use btcd_primitives::transaction::{Transaction, TxIn, TxOut};
use btcd_storage::{memory::MemoryStore, Column, KeyValueStore};

const BASE_TIME: u32 = 1_600_000_000;
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

fn spend(prevout: OutPoint, value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51, tag],
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
    let genesis = mine_block(&params, [0u8; 32], BASE_TIME, vec![coinbase(0, 50 * COIN)]);
    params.consensus.hash_genesis_block = *genesis.hash();
    params.genesis_block = genesis.raw;
    params
}

fn open_chain(
    dir: &std::path::Path,
    params: ChainParams,
    store: Arc<MemoryStore>,
) -> Chain<MemoryStore> {
    let blocks = BlockFiles::open(dir, 10_000_000).expect("block files");
    Chain::open(params, store, blocks, false).expect("chain opens")
}

fn block_time(height: u32) -> u32 {
    BASE_TIME + height * 600
}

fn genesis_coinbase_outpoint(params: &ChainParams) -> OutPoint {
    let mut genesis = Block::new(params.genesis_block.clone()).unwrap();
    genesis.build_tx_list().unwrap();
    OutPoint::new(genesis.txids[0], 0)
}

/// Extends the chain with coinbase-only blocks through `to_height`,
/// returning the hash at each height.
fn grow(
    chain: &Chain<MemoryStore>,
    params: &ChainParams,
    mut prev: Hash256,
    from_height: u32,
    to_height: u32,
) -> Vec<Hash256> {
    let mut hashes = Vec::new();
    for height in from_height..=to_height {
        let mut block = mine_block(
            params,
            prev,
            block_time(height),
            vec![coinbase(height, 50 * COIN)],
        );
        prev = *block.hash();
        hashes.push(prev);
        chain.accept_block(&mut block).expect("extend chain");
    }
    hashes
}

fn utxo_dump(store: &MemoryStore) -> Vec<(Vec<u8>, Vec<u8>)> {
    store.scan_prefix(Column::Utxo, &[]).expect("utxo scan")
}

#[test]
fn reorganization_switches_to_longer_branch() {
    let params = test_params();
    let genesis_outpoint = genesis_coinbase_outpoint(&params);

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let chain = open_chain(dir.path(), params.clone(), Arc::clone(&store));

    // base chain so the genesis coinbase is mature at the fork point
    let base = grow(&chain, &params, params.consensus.hash_genesis_block, 1, 102);
    let fork_point = base[101]; // hash at height 102

    // branch A: spends the genesis coinbase at 103, grows to 105
    let spend_a = spend(genesis_outpoint, 50 * COIN, 0xaa);
    let spend_a_outpoint = OutPoint::new(spend_a.txid(), 0);
    let mut block_103a = mine_block(
        &params,
        fork_point,
        block_time(103),
        vec![coinbase(103, 50 * COIN), spend_a],
    );
    let hash_103a = *block_103a.hash();
    chain.accept_block(&mut block_103a).expect("103a");
    let a_tail = grow(&chain, &params, hash_103a, 104, 105);

    assert_eq!(chain.tip_height(), 105);
    assert!(chain.utxo_lookup(&spend_a_outpoint).unwrap().is_some());
    assert!(chain.utxo_lookup(&genesis_outpoint).unwrap().is_none());

    // branch B: same fork point, pays a fee, one block longer
    let spend_b = spend(genesis_outpoint, 49 * COIN, 0xbb);
    let spend_b_outpoint = OutPoint::new(spend_b.txid(), 0);
    let mut b_blocks = Vec::new();
    let mut prev = fork_point;
    let mut block_103b = mine_block(
        &params,
        prev,
        block_time(103) + 7,
        vec![coinbase(103, 51 * COIN), spend_b],
    );
    prev = *block_103b.hash();
    b_blocks.push(block_103b.raw.clone());
    chain.accept_block(&mut block_103b).expect("103b side-stored");
    assert_eq!(chain.tip_height(), 105, "shorter branch does not switch");

    for height in 104..=106u32 {
        let mut block = mine_block(
            &params,
            prev,
            block_time(height) + 7,
            vec![coinbase(height, 50 * COIN)],
        );
        prev = *block.hash();
        b_blocks.push(block.raw.clone());
        chain.accept_block(&mut block).expect("branch b block");
    }

    // 106B outran branch A: the chain reorganized
    let (tip_hash, tip_height) = chain.tip_info();
    assert_eq!(tip_height, 106);
    assert_eq!(tip_hash, prev);
    assert!(chain.utxo_lookup(&spend_a_outpoint).unwrap().is_none());
    assert_eq!(
        chain.utxo_lookup(&spend_b_outpoint).unwrap().unwrap().value,
        49 * COIN
    );
    assert!(chain.utxo_lookup(&genesis_outpoint).unwrap().is_none());
    let _ = a_tail;

    // the UTXO set equals an independent replay of branch B alone
    let replay_dir = tempfile::tempdir().unwrap();
    let replay_store = Arc::new(MemoryStore::new());
    let replay = open_chain(replay_dir.path(), params.clone(), Arc::clone(&replay_store));
    grow(&replay, &params, params.consensus.hash_genesis_block, 1, 102);
    for raw in &b_blocks {
        let mut block = Block::new(raw.clone()).unwrap();
        replay.accept_block(&mut block).expect("replay branch b");
    }
    assert_eq!(replay.tip_info(), (tip_hash, 106));
    assert_eq!(utxo_dump(&store), utxo_dump(&replay_store));
}

#[test]
fn commit_then_undo_restores_state_bit_exact() {
    let params = test_params();
    let genesis_outpoint = genesis_coinbase_outpoint(&params);

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let chain = open_chain(dir.path(), params.clone(), Arc::clone(&store));
    let base = grow(&chain, &params, params.consensus.hash_genesis_block, 1, 101);

    let utxo_before = utxo_dump(&store);
    let undo_before = store.scan_prefix(Column::Undo, &[]).unwrap();
    let heights_before = store.scan_prefix(Column::HeightIndex, &[]).unwrap();
    let tip_before = chain.tip_info();

    let spend_tx = spend(genesis_outpoint, 50 * COIN, 0xcc);
    let mut block = mine_block(
        &params,
        base[100],
        block_time(102),
        vec![coinbase(102, 50 * COIN), spend_tx],
    );
    chain.accept_block(&mut block).expect("commit spend block");
    assert_eq!(chain.tip_height(), 102);
    assert!(chain.utxo_lookup(&genesis_outpoint).unwrap().is_none());

    chain.undo_last_block().expect("undo");

    assert_eq!(chain.tip_info(), tip_before);
    assert_eq!(utxo_dump(&store), utxo_before);
    assert_eq!(store.scan_prefix(Column::Undo, &[]).unwrap(), undo_before);
    assert_eq!(
        store.scan_prefix(Column::HeightIndex, &[]).unwrap(),
        heights_before
    );
    assert!(chain.utxo_lookup(&genesis_outpoint).unwrap().is_some());
}

#[test]
fn blocks_hooking_below_the_unwind_window_are_rejected() {
    let params = test_params();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let chain = open_chain(dir.path(), params.clone(), Arc::clone(&store));

    let base = grow(&chain, &params, params.consensus.hash_genesis_block, 1, 290);
    assert_eq!(chain.tip_height(), 290);

    // parent at height 1: 290 - 2 >= 288
    let mut deep = mine_block(
        &params,
        base[0],
        block_time(2) + 13,
        vec![coinbase(2, 50 * COIN)],
    );
    let err = chain.accept_block(&mut deep).unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("RPC_Result:bad-prevblk"), "{rendered}");
    assert_eq!(chain.tip_height(), 290);
}
