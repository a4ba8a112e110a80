//! Context-free block and transaction checks, and the rejection type the
//! validator reports through.
//!
//! Rejection messages carry an `RPC_Result:` tail so block submitters get
//! the canonical reject code verbatim.

use btcd_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_TX_SIZE};
use btcd_consensus::money::money_range;
use btcd_consensus::Hash256;
use btcd_primitives::block::Block;
use btcd_primitives::merkle::merkle_root;
use btcd_primitives::transaction::Transaction;
use btcd_script::sigop_count;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectKind {
    /// A consensus violation; `dos` marks the sender as hostile.
    Consensus { dos: bool },
    /// Already indexed; only a counter increments.
    Duplicate,
    /// The genesis block resubmitted; not an offense.
    Genesis,
    /// Parent not in the index; the block may link later.
    ParentUnknown,
}

#[derive(Clone, Debug)]
pub struct BlockReject {
    pub kind: RejectKind,
    pub message: String,
    pub rpc_result: &'static str,
}

impl BlockReject {
    pub fn dos(message: impl Into<String>, rpc_result: &'static str) -> Self {
        Self {
            kind: RejectKind::Consensus { dos: true },
            message: message.into(),
            rpc_result,
        }
    }

    pub fn soft(message: impl Into<String>, rpc_result: &'static str) -> Self {
        Self {
            kind: RejectKind::Consensus { dos: false },
            message: message.into(),
            rpc_result,
        }
    }

    pub fn duplicate(hash: &Hash256) -> Self {
        Self {
            kind: RejectKind::Duplicate,
            message: format!("block {} already in", btcd_consensus::hash_to_hex(hash)),
            rpc_result: "duplicate",
        }
    }

    pub fn genesis() -> Self {
        Self {
            kind: RejectKind::Genesis,
            message: "genesis".to_string(),
            rpc_result: "duplicate",
        }
    }

    pub fn parent_unknown(hash: &Hash256) -> Self {
        Self {
            kind: RejectKind::ParentUnknown,
            message: format!(
                "block {} parent not found",
                btcd_consensus::hash_to_hex(hash)
            ),
            rpc_result: "bad-prevblk",
        }
    }

    pub fn is_dos(&self) -> bool {
        matches!(self.kind, RejectKind::Consensus { dos: true })
    }

    pub fn maybe_later(&self) -> bool {
        self.kind == RejectKind::ParentUnknown
    }
}

impl std::fmt::Display for BlockReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - RPC_Result:{}", self.message, self.rpc_result)
    }
}

impl std::error::Error for BlockReject {}

/// Context-free transaction rules shared by block and mempool admission.
pub fn check_transaction(tx: &Transaction, coinbase_position: bool) -> Result<(), BlockReject> {
    if tx.vin.is_empty() || tx.vout.is_empty() {
        return Err(BlockReject::dos("transaction without inputs or outputs", "bad-tx"));
    }
    if tx.serialized_size() > MAX_TX_SIZE {
        return Err(BlockReject::dos("transaction oversize", "bad-tx"));
    }

    let mut total_out: i64 = 0;
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(BlockReject::dos("txout value out of range", "bad-tx"));
        }
        total_out = total_out.saturating_add(output.value);
        if !money_range(total_out) {
            return Err(BlockReject::dos("txout total out of range", "bad-tx"));
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(BlockReject::dos("duplicate input", "bad-txns-inputs-duplicate"));
        }
    }

    if coinbase_position {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(BlockReject::dos("bad coinbase script length", "bad-cb-length"));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(BlockReject::dos("null prevout outside coinbase", "bad-txns-prevout-null"));
            }
        }
    }
    Ok(())
}

/// The expensive part of PostCheckBlock for untrusted blocks: coinbase
/// placement, the Merkle commitment (including the duplicate-tx
/// mutation), per-transaction rules and the block sigop bound.
/// Returns the block's legacy sigop count.
pub fn check_block_transactions(block: &Block) -> Result<u32, BlockReject> {
    let txs = &block.txs;
    if txs.is_empty() || !txs[0].is_coinbase() {
        return Err(BlockReject::dos("first tx is not coinbase", "bad-cb-missing"));
    }
    for tx in &txs[1..] {
        if tx.is_coinbase() {
            return Err(BlockReject::dos("more than one coinbase", "bad-cb-multiple"));
        }
    }

    let (root, mutated) = merkle_root(&block.txids);
    if mutated {
        return Err(BlockReject::dos("duplicate transaction", "bad-txns-duplicate"));
    }
    if root != block.header.merkle_root {
        return Err(BlockReject::dos("merkle root mismatch", "bad-txnmrklroot"));
    }

    let mut sigops: u32 = 0;
    for (index, tx) in txs.iter().enumerate() {
        check_transaction(tx, index == 0)?;
        for input in &tx.vin {
            sigops = sigops.saturating_add(sigop_count(&input.script_sig));
        }
        for output in &tx.vout {
            sigops = sigops.saturating_add(sigop_count(&output.script_pubkey));
        }
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(BlockReject::dos("too many sigops", "bad-blk-sigops"));
        }
    }
    Ok(sigops)
}

/// The BIP34 rule: v2+ blocks commit their height as the first push of
/// the coinbase script. Heights on live networks are wide enough that the
/// fixed three-byte form (wider past 2^23) is the canonical encoding.
pub fn check_coinbase_height(block: &Block) -> Result<(), BlockReject> {
    let height = block.height;
    let expected: Vec<u8> = if height < 0x80_0000 {
        vec![3, height as u8, (height >> 8) as u8, (height >> 16) as u8]
    } else if height < 0x8000_0000 {
        vec![
            4,
            height as u8,
            (height >> 8) as u8,
            (height >> 16) as u8,
            (height >> 24) as u8,
        ]
    } else {
        vec![
            5,
            height as u8,
            (height >> 8) as u8,
            (height >> 16) as u8,
            (height >> 24) as u8,
            0,
        ]
    };
    let script_sig = block
        .txs
        .first()
        .and_then(|tx| tx.vin.first())
        .map(|input| input.script_sig.as_slice())
        .unwrap_or_default();
    if script_sig.len() < expected.len() || script_sig[..expected.len()] != expected[..] {
        return Err(BlockReject::dos(
            "unexpected block number in coinbase",
            "bad-cb-height",
        ));
    }
    Ok(())
}

/// Cheap structural size gate, part of PreCheckBlock.
pub fn check_block_size(block: &Block) -> Result<(), BlockReject> {
    if block.size() < 81 || block.size() > MAX_BLOCK_SIZE {
        return Err(BlockReject::dos("size limits failed", "bad-blk-length"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcd_primitives::outpoint::OutPoint;
    use btcd_primitives::transaction::{TxIn, TxOut};

    fn plain_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn duplicate_inputs_rejected() {
        let mut tx = plain_tx();
        tx.vin.push(tx.vin[0].clone());
        let err = check_transaction(&tx, false).unwrap_err();
        assert_eq!(err.rpc_result, "bad-txns-inputs-duplicate");
        assert!(err.is_dos());
    }

    #[test]
    fn negative_value_rejected() {
        let mut tx = plain_tx();
        tx.vout[0].value = -1;
        assert_eq!(check_transaction(&tx, false).unwrap_err().rpc_result, "bad-tx");
    }

    #[test]
    fn null_prevout_outside_coinbase_rejected() {
        let mut tx = plain_tx();
        tx.vin[0].prevout = OutPoint::null();
        assert_eq!(
            check_transaction(&tx, false).unwrap_err().rpc_result,
            "bad-txns-prevout-null"
        );
    }

    #[test]
    fn coinbase_script_bounds() {
        let mut tx = plain_tx();
        tx.vin[0].prevout = OutPoint::null();
        tx.vin[0].script_sig = vec![0u8; 1];
        assert!(check_transaction(&tx, true).is_err());
        tx.vin[0].script_sig = vec![0u8; 2];
        assert!(check_transaction(&tx, true).is_ok());
        tx.vin[0].script_sig = vec![0u8; 101];
        assert!(check_transaction(&tx, true).is_err());
    }
}
