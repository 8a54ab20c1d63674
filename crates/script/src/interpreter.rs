//! Script execution.
//!
//! The interpreter covers the opcode surface this chain's scripts use:
//! pushes, flow control, stack shuffling, small arithmetic, hashing,
//! signature checks, the timelock verifies, the token marker and the
//! offline-staking verify.

use std::sync::OnceLock;

use plbd_primitives::hash::{hash160, ripemd160, sha256, sha256d};
use plbd_primitives::Transaction;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::opcodes::*;
use crate::sighash::{legacy_sighash, segwit_sighash, PrecomputedTxData};
use crate::standard;

pub const VERIFY_NONE: u32 = 0;
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_STRICTENC: u32 = 1 << 1;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_LOW_S: u32 = 1 << 3;
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
pub const VERIFY_WITNESS: u32 = 1 << 11;

/// Flags every block must satisfy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: u32 = VERIFY_P2SH | VERIFY_WITNESS;

/// Flags applied to loose transactions before they enter the mempool.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 = MANDATORY_SCRIPT_VERIFY_FLAGS
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_STACK_SIZE: usize = 1_000;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_ELEMENT_SIZE: usize = 520;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;
const LOCKTIME_THRESHOLD: i64 = 500_000_000;
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff | SEQUENCE_LOCKTIME_TYPE_FLAG;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    Verify,
    EqualVerify,
    NumEqualVerify,
    CheckSigVerify,
    CheckMultiSigVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    UnbalancedConditional,
    OpReturn,
    NegativeLocktime,
    UnsatisfiedLocktime,
    SigDer,
    SigHighS,
    SigHashType,
    PubkeyType,
    SigNullDummy,
    SigPushOnly,
    CleanStack,
    MinimalData,
    DiscourageUpgradableNops,
    WitnessProgramMismatch,
    WitnessProgramEmpty,
    WitnessMalleated,
    WitnessUnexpected,
    PubkeyCount,
    SigCount,
    NotCoinstake,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::ScriptSize => "script too large",
            ScriptError::PushSize => "push exceeds element size limit",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack size limit exceeded",
            ScriptError::Verify => "verify failed",
            ScriptError::EqualVerify => "equalverify failed",
            ScriptError::NumEqualVerify => "numequalverify failed",
            ScriptError::CheckSigVerify => "checksigverify failed",
            ScriptError::CheckMultiSigVerify => "checkmultisigverify failed",
            ScriptError::BadOpcode => "bad opcode",
            ScriptError::DisabledOpcode => "disabled opcode",
            ScriptError::InvalidStackOperation => "invalid stack operation",
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::OpReturn => "op_return encountered",
            ScriptError::NegativeLocktime => "negative locktime",
            ScriptError::UnsatisfiedLocktime => "locktime requirement not satisfied",
            ScriptError::SigDer => "signature der encoding invalid",
            ScriptError::SigHighS => "signature s value too high",
            ScriptError::SigHashType => "invalid sighash type",
            ScriptError::PubkeyType => "invalid public key encoding",
            ScriptError::SigNullDummy => "multisig dummy not null",
            ScriptError::SigPushOnly => "signature script is not push-only",
            ScriptError::CleanStack => "stack not clean after execution",
            ScriptError::MinimalData => "push not minimally encoded",
            ScriptError::DiscourageUpgradableNops => "upgradable nop used",
            ScriptError::WitnessProgramMismatch => "witness program mismatch",
            ScriptError::WitnessProgramEmpty => "witness program witness empty",
            ScriptError::WitnessMalleated => "witness requires empty script sig",
            ScriptError::WitnessUnexpected => "witness provided for non-witness script",
            ScriptError::PubkeyCount => "pubkey count out of range",
            ScriptError::SigCount => "signature count out of range",
            ScriptError::NotCoinstake => "offline stake path outside coinstake",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for ScriptError {}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SigVersion {
    Base,
    WitnessV0,
}

struct Context<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: i64,
    txdata: &'a PrecomputedTxData,
    flags: u32,
}

impl Context<'_> {
    fn check_signature(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
        version: SigVersion,
    ) -> Result<bool, ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(false);
        }
        let (der, hash_type) = split_signature(sig_bytes)?;
        check_signature_encoding(der, hash_type, self.flags)?;
        check_pubkey_encoding(pubkey_bytes, self.flags)?;

        let signature = match parse_der(der, self.flags) {
            Ok(signature) => signature,
            Err(err) => {
                if self.flags & VERIFY_DERSIG != 0 {
                    return Err(err);
                }
                return Ok(false);
            }
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return Ok(false);
        };

        let digest = match version {
            SigVersion::Base => legacy_sighash(self.tx, self.input_index, script_code, hash_type),
            SigVersion::WitnessV0 => segwit_sighash(
                self.tx,
                self.txdata,
                self.input_index,
                script_code,
                self.amount,
                hash_type,
            ),
        };
        let message = Message::from_digest(digest);
        Ok(secp().verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }

    fn check_locktime(&self, locktime: i64) -> Result<(), ScriptError> {
        let tx_locktime = self.tx.lock_time as i64;
        let same_class = (tx_locktime < LOCKTIME_THRESHOLD) == (locktime < LOCKTIME_THRESHOLD);
        if !same_class || locktime > tx_locktime {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if self.tx.vin[self.input_index].sequence == plbd_primitives::TxIn::SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        let tx_sequence = self.tx.vin[self.input_index].sequence as i64;
        if self.tx.version < 2 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let mask = SEQUENCE_LOCKTIME_MASK as i64;
        let masked_locktime = sequence & mask;
        let masked_tx = tx_sequence & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let same_class = (masked_locktime & type_flag) == (masked_tx & type_flag);
        if !same_class || masked_locktime > masked_tx {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }
}

fn split_signature(sig: &[u8]) -> Result<(&[u8], u32), ScriptError> {
    let (last, der) = sig.split_last().ok_or(ScriptError::SigDer)?;
    Ok((der, *last as u32))
}

fn check_signature_encoding(_der: &[u8], hash_type: u32, flags: u32) -> Result<(), ScriptError> {
    if flags & VERIFY_STRICTENC != 0 {
        let base = hash_type & !(crate::sighash::SIGHASH_ANYONECANPAY);
        if !(1..=3).contains(&base) {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn parse_der(der: &[u8], flags: u32) -> Result<ecdsa::Signature, ScriptError> {
    let signature = if flags & VERIFY_DERSIG != 0 {
        ecdsa::Signature::from_der(der).map_err(|_| ScriptError::SigDer)?
    } else {
        ecdsa::Signature::from_der_lax(der).map_err(|_| ScriptError::SigDer)?
    };
    if flags & VERIFY_LOW_S != 0 {
        let mut normalized = signature;
        normalized.normalize_s();
        if normalized != signature {
            return Err(ScriptError::SigHighS);
        }
    }
    Ok(signature)
}

fn check_pubkey_encoding(pubkey: &[u8], flags: u32) -> Result<(), ScriptError> {
    if flags & VERIFY_STRICTENC == 0 {
        return Ok(());
    }
    let valid = match pubkey.first() {
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        Some(0x04) => pubkey.len() == 65,
        _ => false,
    };
    if !valid {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn cast_to_bool(bytes: &[u8]) -> bool {
    for (index, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            // A negative zero is false.
            return !(index == bytes.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn script_num(bytes: &[u8], require_minimal: bool) -> Result<i64, ScriptError> {
    script_num_with_max(bytes, 4, require_minimal)
}

fn script_num_with_max(
    bytes: &[u8],
    max_len: usize,
    require_minimal: bool,
) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::InvalidStackOperation);
    }
    if require_minimal && !bytes.is_empty() {
        let last = bytes[bytes.len() - 1];
        if last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
            return Err(ScriptError::MinimalData);
        }
    }
    let mut value = 0i64;
    for (index, byte) in bytes.iter().enumerate() {
        value |= (*byte as i64) << (8 * index);
    }
    if let Some(last) = bytes.last() {
        if last & 0x80 != 0 {
            let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
            value = -(value & mask);
        }
    }
    Ok(value)
}

fn encode_num(mut value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    if negative {
        value = -value;
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push((value & 0xff) as u8);
        value >>= 8;
    }
    let last = *out.last().expect("non-zero value");
    if last & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let idx = out.len() - 1;
        out[idx] |= 0x80;
    }
    out
}

/// Parse the next opcode starting at `pc`; returns the opcode, optional
/// push payload, and the offset past it.
fn next_op(script: &[u8], pc: usize) -> Result<(u8, Option<&[u8]>, usize), ScriptError> {
    let opcode = script[pc];
    let mut cursor = pc + 1;
    let push_len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => {
            let len = *script.get(cursor).ok_or(ScriptError::BadOpcode)? as usize;
            cursor += 1;
            len
        }
        OP_PUSHDATA2 => {
            let bytes = script.get(cursor..cursor + 2).ok_or(ScriptError::BadOpcode)?;
            cursor += 2;
            u16::from_le_bytes(bytes.try_into().expect("length checked")) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = script.get(cursor..cursor + 4).ok_or(ScriptError::BadOpcode)?;
            cursor += 4;
            u32::from_le_bytes(bytes.try_into().expect("length checked")) as usize
        }
        _ => return Ok((opcode, None, cursor)),
    };
    let data = script
        .get(cursor..cursor + push_len)
        .ok_or(ScriptError::BadOpcode)?;
    Ok((opcode, Some(data), cursor + push_len))
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match next_op(script, pc) {
            Ok((opcode, _, next)) if opcode <= OP_16 => pc = next,
            _ => return false,
        }
    }
    true
}

fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: u32,
    ctx: &Context<'_>,
    version: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = flags & VERIFY_MINIMALDATA != 0;
    let mut altstack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut pc = 0usize;
    let mut code_separator = 0usize;

    while pc < script.len() {
        let executing = exec_stack.iter().all(|flag| *flag);
        let (opcode, push, next) = next_op(script, pc)?;

        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        if let Some(data) = push {
            if data.len() > MAX_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            if executing {
                stack.push(data.to_vec());
            }
            pc = next;
            if stack.len() + altstack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
            continue;
        }

        if !executing && !matches!(opcode, OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF) {
            pc = next;
            continue;
        }

        match opcode {
            OP_0 => stack.push(Vec::new()),
            OP_1NEGATE => stack.push(encode_num(-1)),
            OP_1..=OP_16 => stack.push(encode_num((opcode - OP_1 + 1) as i64)),

            OP_NOP => {}
            OP_NOP1 | 0xb3..=OP_NOP10 => {
                if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            OP_CHECKLOCKTIMEVERIFY if flags & VERIFY_CHECKLOCKTIMEVERIFY != 0 => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                // Locktime numbers may use up to five bytes.
                let locktime = script_num_with_max(top, 5, require_minimal)?;
                if locktime < 0 {
                    return Err(ScriptError::NegativeLocktime);
                }
                ctx.check_locktime(locktime)?;
            }
            OP_CHECKLOCKTIMEVERIFY => {
                if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }
            OP_CHECKSEQUENCEVERIFY if flags & VERIFY_CHECKSEQUENCEVERIFY != 0 => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                let sequence = script_num(top, require_minimal)?;
                if sequence < 0 {
                    return Err(ScriptError::NegativeLocktime);
                }
                if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0 {
                    ctx.check_sequence(sequence)?;
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if flags & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }

            OP_IF | OP_NOTIF => {
                let mut branch = false;
                if executing {
                    let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                    branch = cast_to_bool(&top);
                    if opcode == OP_NOTIF {
                        branch = !branch;
                    }
                }
                exec_stack.push(branch);
            }
            OP_ELSE => {
                let top = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *top = !*top;
            }
            OP_ENDIF => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                if !cast_to_bool(&top) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => {
                let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                altstack.push(top);
            }
            OP_FROMALTSTACK => {
                let top = altstack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                stack.push(top);
            }
            OP_2DROP => {
                pop_n(stack, 2)?;
            }
            OP_2DUP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 2].clone());
                stack.push(stack[len - 1].clone());
            }
            OP_3DUP => {
                let len = stack.len();
                if len < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 3].clone());
                stack.push(stack[len - 2].clone());
                stack.push(stack[len - 1].clone());
            }
            OP_2OVER => {
                let len = stack.len();
                if len < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 4].clone());
                stack.push(stack[len - 3].clone());
            }
            OP_IFDUP => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                if cast_to_bool(top) {
                    stack.push(top.clone());
                }
            }
            OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
            OP_DROP => {
                stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
            }
            OP_DUP => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                stack.push(top.clone());
            }
            OP_NIP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.remove(len - 2);
            }
            OP_OVER => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.push(stack[len - 2].clone());
            }
            OP_PICK | OP_ROLL => {
                let count = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                if count < 0 || count as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = stack.len() - 1 - count as usize;
                let item = if opcode == OP_ROLL {
                    stack.remove(index)
                } else {
                    stack[index].clone()
                };
                stack.push(item);
            }
            OP_ROT => {
                let len = stack.len();
                if len < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let item = stack.remove(len - 3);
                stack.push(item);
            }
            OP_SWAP => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let top = stack[len - 1].clone();
                stack.insert(len - 2, top);
            }
            OP_SIZE => {
                let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                let size = top.len() as i64;
                stack.push(encode_num(size));
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let b = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let a = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let equal = a == b;
                if opcode == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push(encode_bool(equal));
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let value = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                let result = match opcode {
                    OP_1ADD => value + 1,
                    OP_1SUB => value - 1,
                    OP_NEGATE => -value,
                    OP_ABS => value.abs(),
                    OP_NOT => (value == 0) as i64,
                    _ => (value != 0) as i64,
                };
                stack.push(encode_num(result));
            }
            OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
            | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
            | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                let a = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                let result = match opcode {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_BOOLAND => (a != 0 && b != 0) as i64,
                    OP_BOOLOR => (a != 0 || b != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                    OP_NUMNOTEQUAL => (a != b) as i64,
                    OP_LESSTHAN => (a < b) as i64,
                    OP_GREATERTHAN => (a > b) as i64,
                    OP_LESSTHANOREQUAL => (a <= b) as i64,
                    OP_GREATERTHANOREQUAL => (a >= b) as i64,
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push(encode_num(result));
                }
            }
            OP_WITHIN => {
                let max = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                let min = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                let value = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                stack.push(encode_bool(min <= value && value < max));
            }

            OP_RIPEMD160 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let digest: Vec<u8> = match opcode {
                    OP_SHA256 => sha256(&top).to_vec(),
                    OP_HASH160 => hash160(&top).to_vec(),
                    OP_HASH256 => sha256d(&top).to_vec(),
                    _ => ripemd160(&top).to_vec(),
                };
                stack.push(digest);
            }
            OP_CODESEPARATOR => {
                code_separator = next;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let sig = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                let script_code = &script[code_separator..];
                let ok = ctx.check_signature(&sig, &pubkey, script_code, version)?;
                if opcode == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(encode_bool(ok));
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let key_count = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
                    return Err(ScriptError::PubkeyCount);
                }
                op_count += key_count as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
                let mut pubkeys = Vec::with_capacity(key_count as usize);
                for _ in 0..key_count {
                    pubkeys.push(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
                }
                let sig_count = script_num(
                    &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                    require_minimal,
                )?;
                if sig_count < 0 || sig_count > key_count {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(sig_count as usize);
                for _ in 0..sig_count {
                    sigs.push(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
                }
                let dummy = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                    return Err(ScriptError::SigNullDummy);
                }

                let script_code = &script[code_separator..];
                let mut sig_iter = sigs.into_iter();
                let mut current = sig_iter.next();
                let mut matched = 0i64;
                for pubkey in &pubkeys {
                    let Some(sig) = current.as_ref() else {
                        break;
                    };
                    if ctx.check_signature(sig, pubkey, script_code, version)? {
                        matched += 1;
                        current = sig_iter.next();
                    }
                }
                let ok = matched == sig_count && current.is_none();
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !ok {
                        return Err(ScriptError::CheckMultiSigVerify);
                    }
                } else {
                    stack.push(encode_bool(ok));
                }
            }

            OP_TOKEN => {
                // Token payloads follow as a push and OP_DROP; nothing to do.
            }
            OP_CHECKOFFLINESTAKEVERIFY => {
                if !ctx.tx.is_coinstake() {
                    return Err(ScriptError::NotCoinstake);
                }
            }

            OP_RESERVED => return Err(ScriptError::BadOpcode),
            _ => return Err(ScriptError::BadOpcode),
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        pc = next;
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn pop_n(stack: &mut Vec<Vec<u8>>, count: usize) -> Result<(), ScriptError> {
    if stack.len() < count {
        return Err(ScriptError::InvalidStackOperation);
    }
    stack.truncate(stack.len() - count);
    Ok(())
}

fn encode_bool(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// Verify one input against the output script it spends.
#[allow(clippy::too_many_arguments)]
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    witness: &[Vec<u8>],
    tx: &Transaction,
    input_index: usize,
    amount: i64,
    flags: u32,
    txdata: &PrecomputedTxData,
) -> Result<(), ScriptError> {
    let ctx = Context {
        tx,
        input_index,
        amount,
        txdata,
        flags,
    };

    if flags & VERIFY_SIGPUSHONLY != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(&mut stack, script_sig, flags, &ctx, SigVersion::Base)?;
    let stack_copy = if flags & VERIFY_P2SH != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, &ctx, SigVersion::Base)?;
    if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
        return Err(ScriptError::EvalFalse);
    }

    let mut had_witness = false;
    if flags & VERIFY_WITNESS != 0 {
        if let Some((version, program)) = standard::witness_program(script_pubkey) {
            had_witness = true;
            if !script_sig.is_empty() {
                return Err(ScriptError::WitnessMalleated);
            }
            verify_witness_program(witness, version, program, flags, &ctx)?;
            stack.truncate(1);
        }
    }

    if flags & VERIFY_P2SH != 0 && standard::is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut stack = stack_copy;
        let redeem = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&mut stack, &redeem, flags, &ctx, SigVersion::Base)?;
        if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
            return Err(ScriptError::EvalFalse);
        }
        if flags & VERIFY_WITNESS != 0 {
            if let Some((version, program)) = standard::witness_program(&redeem) {
                had_witness = true;
                verify_witness_program(witness, version, program, flags, &ctx)?;
                stack.truncate(1);
            }
        }
        if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        return Ok(());
    }

    if !had_witness && !witness.is_empty() {
        return Err(ScriptError::WitnessUnexpected);
    }
    if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

fn verify_witness_program(
    witness: &[Vec<u8>],
    version: u8,
    program: &[u8],
    flags: u32,
    ctx: &Context<'_>,
) -> Result<(), ScriptError> {
    if version != 0 {
        // Upgradable witness versions succeed unconditionally.
        return Ok(());
    }
    match program.len() {
        20 => {
            // P2WPKH: implicit pay-to-pubkey-hash under segwit hashing.
            if witness.len() != 2 {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let sig = &witness[0];
            let pubkey = &witness[1];
            if hash160(pubkey) != program {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut script_code = Vec::with_capacity(25);
            script_code.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
            script_code.extend_from_slice(program);
            script_code.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            if !ctx.check_signature(sig, pubkey, &script_code, SigVersion::WitnessV0)? {
                return Err(ScriptError::EvalFalse);
            }
            Ok(())
        }
        32 => {
            // P2WSH: the last witness item is the script.
            let Some((witness_script, rest)) = witness.split_last() else {
                return Err(ScriptError::WitnessProgramEmpty);
            };
            if sha256(witness_script) != *<&[u8; 32]>::try_from(program)
                .map_err(|_| ScriptError::WitnessProgramMismatch)?
            {
                return Err(ScriptError::WitnessProgramMismatch);
            }
            let mut stack: Vec<Vec<u8>> = rest.to_vec();
            eval_script(&mut stack, witness_script, flags, ctx, SigVersion::WitnessV0)?;
            if stack.len() != 1 || !cast_to_bool(&stack[0]) {
                return Err(ScriptError::EvalFalse);
            }
            Ok(())
        }
        _ => Err(ScriptError::WitnessProgramMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        verify_script, ScriptError, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
    };
    use crate::opcodes::{OP_RETURN, OP_TOKEN};
    use crate::sighash::{legacy_sighash, PrecomputedTxData, SIGHASH_ALL};
    use crate::standard::{
        offline_staking_script, pay_to_pubkey_hash, push_data, with_token_data,
    };
    use plbd_primitives::hash::hash160;
    use plbd_primitives::{OutPoint, Transaction, TxIn, TxOut};
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn keypair(seed: u8) -> (SecretKey, Vec<u8>) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).expect("secret key");
        let pubkey = PublicKey::from_secret_key(&secp, &secret)
            .serialize()
            .to_vec();
        (secret, pubkey)
    }

    fn spending_tx() -> Transaction {
        Transaction {
            version: 2,
            time: 1_700_000_000,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [5u8; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: 900,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn sign_input(
        tx: &Transaction,
        secret: &SecretKey,
        script_code: &[u8],
    ) -> Vec<u8> {
        let secp = Secp256k1::new();
        let digest = legacy_sighash(tx, 0, script_code, SIGHASH_ALL);
        let message = Message::from_digest(digest);
        let mut sig = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);
        sig
    }

    #[test]
    fn p2pkh_spend_verifies() {
        let (secret, pubkey) = keypair(0x11);
        let script_pubkey = pay_to_pubkey_hash(&hash160(&pubkey));
        let tx = spending_tx();
        let sig = sign_input(&tx, &secret, &script_pubkey);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &pubkey);

        let txdata = PrecomputedTxData::new(&tx);
        verify_script(
            &script_sig,
            &script_pubkey,
            &[],
            &tx,
            0,
            1_000,
            STANDARD_SCRIPT_VERIFY_FLAGS,
            &txdata,
        )
        .expect("valid spend");
    }

    #[test]
    fn wrong_key_fails() {
        let (_, pubkey) = keypair(0x11);
        let (other_secret, other_pubkey) = keypair(0x22);
        let script_pubkey = pay_to_pubkey_hash(&hash160(&pubkey));
        let tx = spending_tx();
        let sig = sign_input(&tx, &other_secret, &script_pubkey);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &other_pubkey);

        let txdata = PrecomputedTxData::new(&tx);
        let result = verify_script(
            &script_sig,
            &script_pubkey,
            &[],
            &tx,
            0,
            1_000,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            &txdata,
        );
        assert!(result.is_err());
    }

    #[test]
    fn op_return_never_verifies() {
        let tx = spending_tx();
        let txdata = PrecomputedTxData::new(&tx);
        let script_pubkey = vec![OP_RETURN, 0x01, 0xaa];
        let result = verify_script(
            &[],
            &script_pubkey,
            &[],
            &tx,
            0,
            0,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            &txdata,
        );
        assert_eq!(result, Err(ScriptError::OpReturn));
    }

    #[test]
    fn token_suffix_executes_as_noop() {
        let (secret, pubkey) = keypair(0x33);
        let base = pay_to_pubkey_hash(&hash160(&pubkey));
        let script_pubkey = with_token_data(&base, b"TOKEN/PAYLOAD");
        assert!(script_pubkey.contains(&OP_TOKEN));
        let tx = spending_tx();
        let sig = sign_input(&tx, &secret, &script_pubkey);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &pubkey);

        let txdata = PrecomputedTxData::new(&tx);
        verify_script(
            &script_sig,
            &script_pubkey,
            &[],
            &tx,
            0,
            1_000,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            &txdata,
        )
        .expect("token-carrying script spendable");
    }

    #[test]
    fn offline_staking_owner_path_spends_outside_coinstake() {
        let (owner_secret, owner_pubkey) = keypair(0x44);
        let (_, staker_pubkey) = keypair(0x55);
        let script_pubkey =
            offline_staking_script(&hash160(&staker_pubkey), &hash160(&owner_pubkey));
        let tx = spending_tx();
        let sig = sign_input(&tx, &owner_secret, &script_pubkey);

        // <sig> <flag=0> <pubkey>: the owner path takes the ELSE branch.
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        script_sig.push(0x00);
        push_data(&mut script_sig, &owner_pubkey);

        let txdata = PrecomputedTxData::new(&tx);
        verify_script(
            &script_sig,
            &script_pubkey,
            &[],
            &tx,
            0,
            1_000,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            &txdata,
        )
        .expect("owner path spendable");
    }

    #[test]
    fn offline_staking_staker_path_requires_coinstake() {
        let (staker_secret, staker_pubkey) = keypair(0x55);
        let (_, owner_pubkey) = keypair(0x44);
        let script_pubkey =
            offline_staking_script(&hash160(&staker_pubkey), &hash160(&owner_pubkey));
        let tx = spending_tx();
        let sig = sign_input(&tx, &staker_secret, &script_pubkey);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        script_sig.push(0x51);
        push_data(&mut script_sig, &staker_pubkey);

        let txdata = PrecomputedTxData::new(&tx);
        let result = verify_script(
            &script_sig,
            &script_pubkey,
            &[],
            &tx,
            0,
            1_000,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            &txdata,
        );
        assert_eq!(result, Err(ScriptError::NotCoinstake));
    }
}
