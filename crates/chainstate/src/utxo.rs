//! The unspent-output set, a durable map from outpoint to output record.

use btcd_primitives::encoding::{DecodeError, Decoder, Encoder};
use btcd_primitives::outpoint::OutPoint;
use btcd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created the output.
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        decoder.expect_empty()?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut bytes = [0u8; OUTPOINT_KEY_LEN];
    bytes[..32].copy_from_slice(&outpoint.hash);
    bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    bytes
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let key = outpoint_key(outpoint);
        match self.store.get(Column::Utxo, &key)? {
            Some(bytes) => Ok(Some(
                UtxoEntry::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        batch.put(Column::Utxo, outpoint_key(outpoint).as_slice(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, outpoint_key(outpoint).as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entry = UtxoEntry {
            value: 5_000_000_000,
            script_pubkey: vec![0x76, 0xa9],
            height: 42,
            is_coinbase: true,
        };
        assert_eq!(UtxoEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn key_layout() {
        let outpoint = OutPoint::new([0xaau8; 32], 0x0102_0304);
        let key = outpoint_key(&outpoint);
        assert_eq!(&key[..32], &[0xaau8; 32]);
        assert_eq!(&key[32..], &[0x04, 0x03, 0x02, 0x01]);
    }
}
