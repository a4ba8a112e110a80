//! Merkle-tree construction over transaction ids.

use btcd_consensus::{Hash256, NULL_HASH};

use crate::hash::sha256d;

/// Computes the Merkle root of the given txids.
///
/// The second return value flags the duplicate-subtree mutation
/// (CVE-2012-2459): a block whose last entry of an odd level is repeated
/// produces the same root as the unpadded block, so such a tree must be
/// rejected rather than treated as a distinct invalid block.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return (NULL_HASH, false);
    }
    let mut mutated = false;
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        // Equal adjacent hashes are checked before padding: the implicit
        // duplication of a trailing odd element is part of the algorithm,
        // an explicit duplicate in the input is the mutation.
        let mut pos = 0;
        while pos + 1 < level.len() {
            if level[pos] == level[pos + 1] {
                mutated = true;
            }
            pos += 2;
        }
        if level.len() % 2 == 1 {
            let last = *level.last().expect("level not empty");
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&pair[0]);
            concat[32..].copy_from_slice(&pair[1]);
            next.push(sha256d(&concat));
        }
        level = next;
    }
    (level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tx_root_is_txid() {
        let txid = [9u8; 32];
        assert_eq!(merkle_root(&[txid]), (txid, false));
    }

    #[test]
    fn pair_hashes_concatenation() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&a);
        concat[32..].copy_from_slice(&b);
        assert_eq!(merkle_root(&[a, b]), (sha256d(&concat), false));
    }

    #[test]
    fn odd_count_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (root_padded, mutated) = merkle_root(&[a, b, c, c]);
        let (root_odd, clean) = merkle_root(&[a, b, c]);
        assert_eq!(root_padded, root_odd);
        assert!(mutated, "explicit duplication must be flagged");
        assert!(!clean, "implicit padding is not a mutation");
    }
}
