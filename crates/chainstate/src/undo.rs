//! Per-block undo records, the information needed to reverse a commit.

use btcd_consensus::Hash256;
use btcd_primitives::encoding::{DecodeError, Decoder, Encoder};
use btcd_primitives::outpoint::OutPoint;

use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// Everything `undo_block_txs` needs: the outputs the block consumed
/// (with their prior records) and the outpoints it created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockUndo {
    pub block_hash: Hash256,
    pub spent: Vec<SpentOutput>,
    pub created: Vec<OutPoint>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_hash(&self.block_hash);
        encoder.write_u32_le(self.spent.len() as u32);
        for spent in &self.spent {
            spent.outpoint.encode_into(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.write_u32_le(self.created.len() as u32);
        for outpoint in &self.created {
            outpoint.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let block_hash = decoder.read_hash()?;
        let spent_len = decoder.read_u32_le()? as usize;
        let mut spent = Vec::with_capacity(spent_len.min(1 << 16));
        for _ in 0..spent_len {
            let outpoint = OutPoint::decode_from(&mut decoder)?;
            let entry_bytes = decoder.read_var_bytes()?;
            let entry = UtxoEntry::decode(&entry_bytes)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        let created_len = decoder.read_u32_le()? as usize;
        let mut created = Vec::with_capacity(created_len.min(1 << 16));
        for _ in 0..created_len {
            created.push(OutPoint::decode_from(&mut decoder)?);
        }
        decoder.expect_empty()?;
        Ok(Self {
            block_hash,
            spent,
            created,
        })
    }
}

/// Undo records are keyed by height, big-endian for ordered scans.
pub fn undo_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_roundtrip() {
        let undo = BlockUndo {
            block_hash: [3u8; 32],
            spent: vec![SpentOutput {
                outpoint: OutPoint::new([1u8; 32], 0),
                entry: UtxoEntry {
                    value: 100,
                    script_pubkey: vec![0x51],
                    height: 7,
                    is_coinbase: false,
                },
            }],
            created: vec![OutPoint::new([2u8; 32], 1), OutPoint::new([2u8; 32], 2)],
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).unwrap(), undo);
    }
}
