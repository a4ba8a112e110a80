//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// The maximum allowed number of legacy signature operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = (MAX_BLOCK_SIZE / 50) as u32;
/// The maximum size of a transaction we will relay or mine.
pub const MAX_TX_SIZE: usize = 100_000;
/// Coinbase outputs can only be spent after this many confirmations.
pub const COINBASE_MATURITY: u32 = 100;
/// Blocks hooking into the chain deeper than this below the tip are rejected;
/// it also bounds how many undo records the UTXO store must retain.
pub const MOVING_CHECKPOINT_DEPTH: u32 = 288;
/// Block timestamps may run at most this far ahead of our clock, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;
/// Number of ancestors (inclusive) feeding the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Unix time at which BIP16 (P2SH) evaluation becomes mandatory.
pub const BIP16_SWITCH_TIME: u32 = 1_333_238_400;

/// Current network protocol version advertised in `version` messages.
pub const PROTOCOL_VERSION: u32 = 70_001;
/// Oldest protocol version we are willing to talk to.
pub const MIN_PROTO_VERSION: u32 = 209;

/// nLockTime values below this are block heights, above it unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
