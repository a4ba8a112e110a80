//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    /// Highest admissible target, little-endian.
    pub pow_limit: Hash256,
    /// Two weeks, in seconds.
    pub pow_target_timespan: i64,
    /// Ten minutes, in seconds.
    pub pow_target_spacing: i64,
    /// Testnet rule: a block 2x spacing late may use the minimum difficulty.
    pub pow_allow_min_difficulty: bool,
    pub pow_no_retargeting: bool,
    /// Number of recent blocks examined for the version-majority rules.
    pub majority_window: usize,
    /// Upgraded-version count at which outdated blocks are rejected.
    pub majority_reject_outdated: u32,
    /// Upgraded-version count at which the upgraded rules are enforced.
    pub majority_enforce_upgrade: u32,
}

impl ConsensusParams {
    /// Blocks per difficulty period (2016 on the production networks).
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Wire magic prefixing every P2P message.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub consensus: ConsensusParams,
    /// The serialized genesis block, committed at first start.
    pub genesis_block: Vec<u8>,
}

// The genesis coinbase is shared by every network; only the header's
// time, bits and nonce fields differ.
const GENESIS_MAINNET_HEX: &str = "\
0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd\
7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c\
0101000000010000000000000000000000000000000000000000000000000000000000000000ffff\
ffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c\
6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73\
ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a6\
7962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f\
ac00000000";

const GENESIS_HASH_MAINNET: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const GENESIS_HASH_TESTNET: &str =
    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";
const GENESIS_HASH_REGTEST: &str =
    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit in embedded constant"),
    }
}

fn decode_hex(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();
    assert!(bytes.len() % 2 == 0, "embedded hex has odd length");
    bytes
        .chunks(2)
        .map(|pair| (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]))
        .collect()
}

/// Parses a hash from its conventional (reversed) display form.
fn decode_display_hash(raw: &str) -> Hash256 {
    let bytes = decode_hex(raw);
    assert_eq!(bytes.len(), 32, "embedded hash has wrong length");
    let mut out = [0u8; 32];
    for (i, byte) in bytes.iter().rev().enumerate() {
        out[i] = *byte;
    }
    out
}

fn genesis_block(network: Network) -> Vec<u8> {
    let mut raw = decode_hex(GENESIS_MAINNET_HEX);
    match network {
        Network::Mainnet => {}
        Network::Testnet => {
            raw[68..72].copy_from_slice(&1_296_688_602u32.to_le_bytes());
            raw[76..80].copy_from_slice(&414_098_458u32.to_le_bytes());
        }
        Network::Regtest => {
            raw[68..72].copy_from_slice(&1_296_688_602u32.to_le_bytes());
            raw[72..76].copy_from_slice(&0x207f_ffffu32.to_le_bytes());
            raw[76..80].copy_from_slice(&2u32.to_le_bytes());
        }
    }
    raw
}

fn production_pow_limit() -> Hash256 {
    let mut limit = [0xffu8; 32];
    limit[28..32].fill(0);
    limit
}

fn regtest_pow_limit() -> Hash256 {
    let mut limit = [0xffu8; 32];
    limit[31] = 0x7f;
    limit
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            consensus: ConsensusParams {
                hash_genesis_block: decode_display_hash(GENESIS_HASH_MAINNET),
                pow_limit: production_pow_limit(),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: false,
                pow_no_retargeting: false,
                majority_window: 1000,
                majority_reject_outdated: 950,
                majority_enforce_upgrade: 750,
            },
            genesis_block: genesis_block(network),
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            consensus: ConsensusParams {
                hash_genesis_block: decode_display_hash(GENESIS_HASH_TESTNET),
                pow_limit: production_pow_limit(),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retargeting: false,
                majority_window: 100,
                majority_reject_outdated: 75,
                majority_enforce_upgrade: 51,
            },
            genesis_block: genesis_block(network),
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            consensus: ConsensusParams {
                hash_genesis_block: decode_display_hash(GENESIS_HASH_REGTEST),
                pow_limit: regtest_pow_limit(),
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 10 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retargeting: true,
                majority_window: 100,
                majority_reject_outdated: 75,
                majority_enforce_upgrade: 51,
            },
            genesis_block: genesis_block(network),
        },
    }
}
