//! The legacy transaction signature hash.

use btcd_consensus::Hash256;
use btcd_primitives::encoding::Encoder;
use btcd_primitives::hash::sha256d;
use btcd_primitives::transaction::Transaction;

use crate::opcodes::OP_CODESEPARATOR;
use crate::parse_op;

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Computes the digest a signature on `input` commits to.
///
/// `script_code` is the previous output's script (or the redeem script for
/// P2SH); OP_CODESEPARATOR occurrences are stripped as in the original
/// serializer. The historical quirk stands: SIGHASH_SINGLE with an input
/// index past the outputs hashes the constant `1` digest instead of
/// failing.
pub fn signature_hash(
    tx: &Transaction,
    input: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash256 {
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return one;
    }

    let script_code = strip_code_separators(script_code);
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    if anyone_can_pay {
        encoder.write_varint(1);
        serialize_input(&mut encoder, tx, input, input, &script_code, base_type);
    } else {
        encoder.write_varint(tx.vin.len() as u64);
        for index in 0..tx.vin.len() {
            serialize_input(&mut encoder, tx, index, input, &script_code, base_type);
        }
    }

    match base_type {
        SIGHASH_NONE => encoder.write_varint(0),
        SIGHASH_SINGLE => {
            encoder.write_varint(input as u64 + 1);
            for (index, output) in tx.vout.iter().take(input + 1).enumerate() {
                if index == input {
                    encoder.write_i64_le(output.value);
                    encoder.write_var_bytes(&output.script_pubkey);
                } else {
                    encoder.write_i64_le(-1);
                    encoder.write_varint(0);
                }
            }
        }
        _ => {
            encoder.write_varint(tx.vout.len() as u64);
            for output in &tx.vout {
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn serialize_input(
    encoder: &mut Encoder,
    tx: &Transaction,
    index: usize,
    signed_input: usize,
    script_code: &[u8],
    base_type: u32,
) {
    let txin = &tx.vin[index];
    txin.prevout.encode_into(encoder);
    if index == signed_input {
        encoder.write_var_bytes(script_code);
        encoder.write_u32_le(txin.sequence);
    } else {
        encoder.write_varint(0);
        let sequence = if base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE {
            0
        } else {
            txin.sequence
        };
        encoder.write_u32_le(sequence);
    }
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0usize;
    while pc < script.len() {
        let start = pc;
        match parse_op(script, &mut pc) {
            Some((OP_CODESEPARATOR, _)) => {}
            Some(_) => out.extend_from_slice(&script[start..pc]),
            None => {
                // malformed trailing push: keep the remainder verbatim
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcd_primitives::outpoint::OutPoint;
    use btcd_primitives::transaction::{TxIn, TxOut};

    fn two_in_two_out() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                },
            ],
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20,
                    script_pubkey: vec![0x52],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn single_out_of_range_is_one_digest() {
        let tx = two_in_two_out();
        let digest = signature_hash(&tx, 5, &[0x51], SIGHASH_SINGLE);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(digest, one);
    }

    #[test]
    fn hash_type_changes_digest() {
        let tx = two_in_two_out();
        let all = signature_hash(&tx, 0, &[0x51], SIGHASH_ALL);
        let none = signature_hash(&tx, 0, &[0x51], SIGHASH_NONE);
        let anyone = signature_hash(&tx, 0, &[0x51], SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        assert_ne!(all, none);
        assert_ne!(all, anyone);
    }

    #[test]
    fn code_separators_are_stripped() {
        let tx = two_in_two_out();
        let with_sep = signature_hash(&tx, 0, &[0x51, OP_CODESEPARATOR, 0x52], SIGHASH_ALL);
        let without = signature_hash(&tx, 0, &[0x51, 0x52], SIGHASH_ALL);
        assert_eq!(with_sep, without);
    }
}
