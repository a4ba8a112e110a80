//! Block header and block types.
//!
//! A [`Block`] keeps the raw serialized bytes it arrived with; the
//! transaction list is parsed lazily because most blocks travel through
//! the download pipeline before anything needs their contents.

use btcd_consensus::Hash256;
use rayon::prelude::*;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_LEN: usize = 80;

/// Minimum serialized size of a transaction (empty scripts).
const MIN_TX_LEN: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_LEN] {
        let mut encoder = Encoder::with_capacity(HEADER_LEN);
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        let bytes = encoder.into_inner();
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        decoder.expect_empty()?;
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecodeError {
    /// Fewer than 81 bytes cannot hold a header and a tx count.
    TooShort,
    /// The transaction count does not fit the remaining payload.
    BadTxnCount,
    Decode(DecodeError),
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::TooShort => write!(f, "block too short"),
            BlockDecodeError::BadTxnCount => write!(f, "bad-txn-count"),
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}

#[derive(Clone, Debug)]
pub struct Block {
    /// The contiguous serialized block as received from the wire or disk.
    pub raw: Vec<u8>,
    pub header: BlockHeader,
    hash: Hash256,
    tx_offset: usize,
    tx_count: usize,
    /// Parsed transactions; empty until [`Block::build_tx_list`] runs.
    pub txs: Vec<Transaction>,
    pub txids: Vec<Hash256>,
    pub height: u32,
    pub sigops: u32,
    pub verify_flags: u32,
    pub majority_v2: u32,
    pub majority_v3: u32,
    pub majority_v4: u32,
    /// Set for blocks re-read from our own store; skips the expensive
    /// re-validation on replay.
    pub trusted: bool,
}

impl Block {
    pub fn new(raw: Vec<u8>) -> Result<Self, BlockDecodeError> {
        if raw.len() < HEADER_LEN + 1 {
            return Err(BlockDecodeError::TooShort);
        }
        let header = BlockHeader::consensus_decode(&raw[..HEADER_LEN])
            .map_err(BlockDecodeError::Decode)?;
        let hash = sha256d(&raw[..HEADER_LEN]);

        let mut decoder = Decoder::new(&raw[HEADER_LEN..]);
        let tx_count = decoder
            .read_varint()
            .map_err(|_| BlockDecodeError::BadTxnCount)? as usize;
        let tx_offset = HEADER_LEN + decoder.position();
        if tx_count == 0 || tx_count.saturating_mul(MIN_TX_LEN) > raw.len() - tx_offset {
            return Err(BlockDecodeError::BadTxnCount);
        }

        Ok(Self {
            raw,
            header,
            hash,
            tx_offset,
            tx_count,
            txs: Vec::new(),
            txids: Vec::new(),
            height: 0,
            sigops: 0,
            verify_flags: 0,
            majority_v2: 0,
            majority_v3: 0,
            majority_v4: 0,
            trusted: false,
        })
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn has_tx_list(&self) -> bool {
        !self.txs.is_empty()
    }

    /// Parses the transaction list out of the raw bytes and computes every
    /// txid. Hashing dominates, so it fans out over the rayon pool.
    pub fn build_tx_list(&mut self) -> Result<(), BlockDecodeError> {
        if self.has_tx_list() {
            return Ok(());
        }
        let mut decoder = Decoder::new(&self.raw[self.tx_offset..]);
        let mut txs = Vec::with_capacity(self.tx_count);
        let mut spans = Vec::with_capacity(self.tx_count);
        for _ in 0..self.tx_count {
            let start = self.tx_offset + decoder.position();
            let tx = Transaction::decode_from(&mut decoder)?;
            let end = self.tx_offset + decoder.position();
            txs.push(tx);
            spans.push((start, end));
        }
        decoder.expect_empty()?;

        let raw = &self.raw;
        self.txids = spans
            .par_iter()
            .map(|(start, end)| sha256d(&raw[*start..*end]))
            .collect();
        self.txs = txs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};

    fn build_raw_block(tx_count: usize) -> Vec<u8> {
        let header = BlockHeader {
            version: 2,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_300_000_000,
            bits: 0x207f_ffff,
            nonce: 7,
        };
        let mut raw = header.consensus_encode().to_vec();
        let mut encoder = Encoder::new();
        encoder.write_varint(tx_count as u64);
        raw.extend_from_slice(&encoder.into_inner());
        for i in 0..tx_count {
            let tx = Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig: vec![i as u8],
                    sequence: u32::MAX,
                }],
                vout: vec![TxOut {
                    value: 50,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            };
            raw.extend_from_slice(&tx.consensus_encode());
        }
        raw
    }

    #[test]
    fn header_roundtrip_and_hash() {
        let raw = build_raw_block(1);
        let header = BlockHeader::consensus_decode(&raw[..HEADER_LEN]).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.hash(), sha256d(&raw[..HEADER_LEN]));
    }

    #[test]
    fn lazy_tx_list() {
        let raw = build_raw_block(3);
        let mut block = Block::new(raw).unwrap();
        assert_eq!(block.tx_count(), 3);
        assert!(!block.has_tx_list());
        block.build_tx_list().unwrap();
        assert_eq!(block.txs.len(), 3);
        assert_eq!(block.txids.len(), 3);
        assert_eq!(block.txids[1], block.txs[1].txid());
    }

    #[test]
    fn too_short_rejected() {
        assert_eq!(
            Block::new(vec![0u8; 80]).unwrap_err(),
            BlockDecodeError::TooShort
        );
    }

    #[test]
    fn absurd_tx_count_rejected() {
        let mut raw = build_raw_block(1);
        raw[HEADER_LEN] = 0xfc; // claims 252 transactions in ~70 bytes
        assert_eq!(Block::new(raw).unwrap_err(), BlockDecodeError::BadTxnCount);
    }
}
