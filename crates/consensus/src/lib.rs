//! Consensus-wide types, constants and per-network parameters.

pub mod constants;
pub mod money;
pub mod params;

/// A 32-byte double-SHA256 digest, stored in hashing (little-endian) order.
pub type Hash256 = [u8; 32];

pub const NULL_HASH: Hash256 = [0u8; 32];

/// Short map key derived from a block hash: the first 8 bytes read as a
/// little-endian integer. The block index keys on this directly.
pub fn bidx(hash: &Hash256) -> u64 {
    u64::from_le_bytes([
        hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
    ])
}

/// Renders a hash in the conventional reversed (display) byte order.
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidx_reads_first_eight_bytes_le() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[7] = 0x80;
        assert_eq!(bidx(&hash), 0x8000_0000_0000_0001);
    }

    #[test]
    fn hex_is_reversed() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        assert!(hash_to_hex(&hash).starts_with("ab"));
        assert!(hash_to_hex(&hash).ends_with("00"));
    }
}
