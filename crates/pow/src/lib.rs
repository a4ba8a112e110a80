//! Proof-of-work arithmetic: compact targets, work comparison and the
//! difficulty retarget rule.

use btcd_consensus::params::ConsensusParams;
use btcd_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32 = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // The mantissa's top bit is the sign in the compact encoding; shift it
    // out so the value stays positive.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(u256_to_hash(compact_to_u256(bits)?))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

fn u256_to_hash(value: U256) -> Hash256 {
    let mut out = [0u8; 32];
    value.to_little_endian(&mut out);
    out
}

pub fn pow_limit_bits(params: &ConsensusParams) -> u32 {
    target_to_compact(&params.pow_limit)
}

/// The full proof-of-work check: valid compact encoding, target within the
/// network limit, and the header hash at or below the target.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ConsensusParams) -> bool {
    let target = match compact_to_u256(bits) {
        Ok(target) => target,
        Err(_) => return false,
    };
    if target.is_zero() {
        return false;
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return false;
    }
    U256::from_little_endian(hash) <= target
}

/// Expected work for one block at the given compact target, as used for
/// cumulative chain-work comparison: floor(2^256 / (target + 1)).
pub fn block_proof(bits: u32) -> U256 {
    let target = match compact_to_u256(bits) {
        Ok(target) => target,
        Err(_) => return U256::zero(),
    };
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

/// The every-2016-blocks difficulty adjustment. `actual_timespan` is the
/// time the closing period took; it is clamped to a factor of four in
/// either direction before scaling the previous target.
pub fn retarget(last_bits: u32, actual_timespan: i64, params: &ConsensusParams) -> u32 {
    let timespan = params.pow_target_timespan;
    let actual = actual_timespan.clamp(timespan / 4, timespan * 4);

    let limit = U256::from_little_endian(&params.pow_limit);
    let old_target = match compact_to_u256(last_bits) {
        Ok(target) => target,
        Err(_) => return pow_limit_bits(params),
    };

    let (scaled, overflowed) = old_target.overflowing_mul(U256::from(actual as u64));
    let mut new_target = if overflowed {
        limit
    } else {
        scaled / U256::from(timespan as u64)
    };
    if new_target > limit {
        new_target = limit;
    }
    u256_to_compact(new_target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1d00_ffffu32, 0x1b04_04cb, 0x1703_a30c, 0x207f_ffff] {
            let value = compact_to_u256(bits).unwrap();
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_and_overflow_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
    }
}
