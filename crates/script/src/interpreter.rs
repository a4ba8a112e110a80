//! A stack interpreter covering the script forms that occur in the
//! output patterns we relay and mine: pay-to-pubkey, pay-to-pubkey-hash,
//! pay-to-script-hash, bare multisig and the CLTV template.

use std::sync::OnceLock;

use btcd_consensus::constants::LOCKTIME_THRESHOLD;
use btcd_primitives::hash::{hash160, sha256, sha256d};
use btcd_primitives::transaction::Transaction;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1};

use crate::opcodes::*;
use crate::sighash::signature_hash;
use crate::{is_p2sh, is_push_only, parse_op, VERIFY_CLTV, VERIFY_DERSIG, VERIFY_P2SH};

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_PUSH_SIZE: usize = 520;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_STACK_SIZE: usize = 1_000;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    StackUnderflow,
    BadOpcode,
    DisabledOpcode,
    VerifyFailed,
    EvalFalse,
    OpReturn,
    BadSignatureEncoding,
    PubkeyCount,
    SigCount,
    SigPushOnly,
    NegativeLocktime,
    UnsatisfiedLocktime,
    NumberOverflow,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptError::ScriptSize => "script too large",
            ScriptError::PushSize => "push exceeds 520 bytes",
            ScriptError::OpCount => "operation count exceeded",
            ScriptError::StackSize => "stack size exceeded",
            ScriptError::StackUnderflow => "stack underflow",
            ScriptError::BadOpcode => "unknown or malformed opcode",
            ScriptError::DisabledOpcode => "disabled opcode",
            ScriptError::VerifyFailed => "verify failed",
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::OpReturn => "OP_RETURN encountered",
            ScriptError::BadSignatureEncoding => "non-DER signature",
            ScriptError::PubkeyCount => "invalid pubkey count",
            ScriptError::SigCount => "invalid signature count",
            ScriptError::SigPushOnly => "scriptSig must be push-only",
            ScriptError::NegativeLocktime => "negative locktime operand",
            ScriptError::UnsatisfiedLocktime => "locktime requirement not satisfied",
            ScriptError::NumberOverflow => "script number overflow",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for ScriptError {}

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// Runs `script_sig` then `script_pubkey` on one stack and requires a
/// truthy result, with the BIP16 indirection when the flag is active.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input: usize,
    flags: u32,
) -> Result<(), ScriptError> {
    let p2sh_active = flags & VERIFY_P2SH != 0 && is_p2sh(script_pubkey);
    if p2sh_active && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(script_sig, &mut stack, tx, input, flags)?;
    let sig_stack = stack.clone();
    eval_script(script_pubkey, &mut stack, tx, input, flags)?;
    if !stack.last().map(|top| truthy(top)).unwrap_or(false) {
        return Err(ScriptError::EvalFalse);
    }

    if p2sh_active {
        stack = sig_stack;
        let redeem = stack.pop().ok_or(ScriptError::StackUnderflow)?;
        eval_script(&redeem, &mut stack, tx, input, flags)?;
        if !stack.last().map(|top| truthy(top)).unwrap_or(false) {
            return Err(ScriptError::EvalFalse);
        }
    }
    Ok(())
}

fn truthy(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // negative zero is false
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn script_num(data: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumberOverflow);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for (index, byte) in data.iter().enumerate() {
        let byte = if index == data.len() - 1 {
            *byte & 0x7f
        } else {
            *byte
        };
        value |= (byte as i64) << (8 * index);
    }
    if data[data.len() - 1] & 0x80 != 0 {
        value = -value;
    }
    Ok(value)
}

fn push_num(stack: &mut Vec<Vec<u8>>, value: i64) {
    if value == 0 {
        stack.push(Vec::new());
        return;
    }
    let mut out = Vec::new();
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map(|byte| byte & 0x80 != 0).unwrap_or(false) {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    stack.push(out);
}

fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    tx: &Transaction,
    input: usize,
    flags: u32,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut pc = 0usize;
    let mut op_count = 0usize;
    while pc < script.len() {
        let (op, data) = parse_op(script, &mut pc).ok_or(ScriptError::BadOpcode)?;
        if op > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if data.len() > MAX_PUSH_SIZE {
            return Err(ScriptError::PushSize);
        }

        match op {
            OP_0 => stack.push(Vec::new()),
            0x01..=0x4b | OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4 => {
                stack.push(data.to_vec())
            }
            OP_1NEGATE => push_num(stack, -1),
            OP_1..=OP_16 => push_num(stack, (op - OP_1 + 1) as i64),
            OP_NOP | OP_NOP1 | 0xb2..=OP_NOP10 => {}
            OP_CHECKLOCKTIMEVERIFY => {
                if flags & VERIFY_CLTV == 0 {
                    // plain NOP2 before deployment
                } else {
                    check_locktime(stack, tx, input)?;
                }
            }
            OP_VERIFY => {
                let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                if !truthy(&top) {
                    return Err(ScriptError::VerifyFailed);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),
            OP_DROP => {
                stack.pop().ok_or(ScriptError::StackUnderflow)?;
            }
            OP_DUP => {
                let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                stack.push(top);
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let b = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let a = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let equal = a == b;
                if op == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if equal { vec![1] } else { Vec::new() });
                }
            }
            OP_SHA256 => {
                let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                stack.push(sha256(&top).to_vec());
            }
            OP_HASH160 => {
                let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                stack.push(hash160(&top).to_vec());
            }
            OP_HASH256 => {
                let top = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                stack.push(sha256d(&top).to_vec());
            }
            OP_CODESEPARATOR => {}
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let sig = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let ok = check_signature(&sig, &pubkey, script, tx, input, flags)?;
                if op == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if ok { vec![1] } else { Vec::new() });
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let ok = check_multisig(stack, script, tx, input, flags)?;
                if op == OP_CHECKMULTISIGVERIFY {
                    if !ok {
                        return Err(ScriptError::VerifyFailed);
                    }
                } else {
                    stack.push(if ok { vec![1] } else { Vec::new() });
                }
            }
            OP_RESERVED | 0x62 | 0x65 | 0x66 | 0x89 | 0x8a => {
                return Err(ScriptError::BadOpcode)
            }
            _ => return Err(ScriptError::DisabledOpcode),
        }

        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }
    Ok(())
}

fn check_locktime(
    stack: &[Vec<u8>],
    tx: &Transaction,
    input: usize,
) -> Result<(), ScriptError> {
    let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
    let locktime = script_num(top, 5)?;
    if locktime < 0 {
        return Err(ScriptError::NegativeLocktime);
    }
    let locktime = locktime as u64;
    let tx_locktime = tx.lock_time as u64;
    let same_kind = (locktime < LOCKTIME_THRESHOLD as u64)
        == (tx_locktime < LOCKTIME_THRESHOLD as u64);
    if !same_kind || locktime > tx_locktime {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    // a final input would make nLockTime inert
    if tx.vin[input].sequence == u32::MAX {
        return Err(ScriptError::UnsatisfiedLocktime);
    }
    Ok(())
}

/// Parses a wire signature. An unparseable signature yields a clean
/// `false` result, except under BIP66 where a non-DER encoding is a
/// script failure in its own right.
fn parse_signature(sig: &[u8], flags: u32) -> Result<Option<(Signature, u32)>, ScriptError> {
    if sig.is_empty() {
        return Ok(None);
    }
    let (der, hash_type) = sig.split_at(sig.len() - 1);
    let hash_type = hash_type[0] as u32;
    if flags & VERIFY_DERSIG != 0 {
        match Signature::from_der(der) {
            Ok(parsed) => Ok(Some((parsed, hash_type))),
            Err(_) => Err(ScriptError::BadSignatureEncoding),
        }
    } else {
        Ok(Signature::from_der_lax(der).ok().map(|parsed| (parsed, hash_type)))
    }
}

fn check_signature(
    sig: &[u8],
    pubkey: &[u8],
    script_code: &[u8],
    tx: &Transaction,
    input: usize,
    flags: u32,
) -> Result<bool, ScriptError> {
    let Some((mut signature, hash_type)) = parse_signature(sig, flags)? else {
        return Ok(false);
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return Ok(false);
    };
    let digest = signature_hash(tx, input, script_code, hash_type);
    let message = Message::from_digest(digest);
    signature.normalize_s();
    Ok(secp().verify_ecdsa(&message, &signature, &pubkey).is_ok())
}

fn check_multisig(
    stack: &mut Vec<Vec<u8>>,
    script_code: &[u8],
    tx: &Transaction,
    input: usize,
    flags: u32,
) -> Result<bool, ScriptError> {
    let key_count_raw = stack.pop().ok_or(ScriptError::StackUnderflow)?;
    let key_count = script_num(&key_count_raw, 4)?;
    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
        return Err(ScriptError::PubkeyCount);
    }
    let mut pubkeys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        pubkeys.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
    }
    pubkeys.reverse();

    let sig_count_raw = stack.pop().ok_or(ScriptError::StackUnderflow)?;
    let sig_count = script_num(&sig_count_raw, 4)?;
    if sig_count < 0 || sig_count > key_count {
        return Err(ScriptError::SigCount);
    }
    let mut sigs = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        sigs.push(stack.pop().ok_or(ScriptError::StackUnderflow)?);
    }
    sigs.reverse();

    // the off-by-one in the original CHECKMULTISIG consumes one extra item
    stack.pop().ok_or(ScriptError::StackUnderflow)?;

    let mut key_index = 0usize;
    let mut matched = 0usize;
    for sig in &sigs {
        let mut found = false;
        while key_index < pubkeys.len() {
            let candidate = &pubkeys[key_index];
            key_index += 1;
            if check_signature(sig, candidate, script_code, tx, input, flags)? {
                found = true;
                break;
            }
        }
        if !found {
            return Ok(false);
        }
        matched += 1;
    }
    Ok(matched == sigs.len())
}
