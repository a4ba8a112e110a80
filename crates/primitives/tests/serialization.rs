use btcd_consensus::params::{chain_params, Network};
use btcd_primitives::block::{Block, HEADER_LEN};
use btcd_primitives::merkle::merkle_root;
use btcd_primitives::transaction::Transaction;

#[test]
fn genesis_block_parses_and_hashes() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        let mut block = Block::new(params.genesis_block.clone()).expect("genesis parses");
        assert_eq!(
            *block.hash(),
            params.consensus.hash_genesis_block,
            "genesis hash mismatch on {}",
            network.as_str()
        );
        block.build_tx_list().expect("genesis tx list");
        assert_eq!(block.tx_count(), 1);
        assert!(block.txs[0].is_coinbase());

        let (root, mutated) = merkle_root(&block.txids);
        assert!(!mutated);
        assert_eq!(root, block.header.merkle_root);
    }
}

#[test]
fn genesis_coinbase_reencodes_identically() {
    let params = chain_params(Network::Mainnet);
    let raw_tx = &params.genesis_block[HEADER_LEN + 1..];
    let tx = Transaction::consensus_decode(raw_tx).expect("coinbase decodes");
    assert_eq!(tx.consensus_encode(), raw_tx);
    assert_eq!(tx.vout[0].value, 5_000_000_000);
}
