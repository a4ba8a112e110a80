use btcd_consensus::params::{chain_params, Network};
use btcd_pow::{
    block_proof, check_proof_of_work, compact_to_u256, pow_limit_bits, retarget,
    target_to_compact,
};
use btcd_primitives::block::BlockHeader;
use primitive_types::U256;

#[test]
fn production_pow_limit_encodes_as_1d00ffff() {
    let params = chain_params(Network::Mainnet);
    assert_eq!(pow_limit_bits(&params.consensus), 0x1d00_ffff);

    let regtest = chain_params(Network::Regtest);
    assert_eq!(pow_limit_bits(&regtest.consensus), 0x207f_ffff);
}

#[test]
fn genesis_satisfies_proof_of_work() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        let header = BlockHeader::consensus_decode(&params.genesis_block[..80]).unwrap();
        let hash = header.hash();
        assert!(
            check_proof_of_work(&hash, header.bits, &params.consensus),
            "genesis fails pow on {}",
            network.as_str()
        );
    }
}

#[test]
fn tampered_genesis_fails_proof_of_work() {
    let params = chain_params(Network::Mainnet);
    let mut raw = params.genesis_block[..80].to_vec();
    raw[76] ^= 0x01; // flip a nonce bit
    let header = BlockHeader::consensus_decode(&raw).unwrap();
    assert!(!check_proof_of_work(&header.hash(), header.bits, &params.consensus));
}

#[test]
fn retarget_is_neutral_on_exact_timespan() {
    let params = chain_params(Network::Mainnet);
    let timespan = params.consensus.pow_target_timespan;
    assert_eq!(retarget(0x1d00_ffff, timespan, &params.consensus), 0x1d00_ffff);
}

#[test]
fn retarget_clamps_to_factor_four() {
    let params = chain_params(Network::Mainnet);
    let consensus = &params.consensus;
    let timespan = consensus.pow_target_timespan;

    // An absurdly fast period is treated as timespan/4.
    let fast = retarget(0x1c3f_ffc0, 1, consensus);
    let quartered = retarget(0x1c3f_ffc0, timespan / 4, consensus);
    assert_eq!(fast, quartered);
    assert_eq!(
        compact_to_u256(fast).unwrap(),
        compact_to_u256(0x1c3f_ffc0).unwrap() / U256::from(4u64)
    );

    // An absurdly slow one as timespan*4, clipped to the pow limit.
    let slow = retarget(0x1d00_ffff, timespan * 100, consensus);
    assert_eq!(slow, pow_limit_bits(consensus));
}

#[test]
fn more_work_for_lower_target() {
    assert!(block_proof(0x1b04_04cb) > block_proof(0x1d00_ffff));
    // target 0x7fffff << 216: roughly one block in 2^17 hashes
    let limit_proof = block_proof(0x207f_ffff);
    assert_eq!(limit_proof, U256::from(131_072u64));
}

#[test]
fn compact_of_target_roundtrip_through_bytes() {
    let params = chain_params(Network::Mainnet);
    assert_eq!(target_to_compact(&params.consensus.pow_limit), 0x1d00_ffff);
}
