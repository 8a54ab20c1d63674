//! Standard script templates and introspection.

use plbd_primitives::hash::hash160;

use crate::interpreter::is_push_only;
use crate::opcodes::*;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptClass {
    PayToPubkey(Vec<u8>),
    PayToPubkeyHash([u8; 20]),
    PayToScriptHash([u8; 20]),
    WitnessV0KeyHash([u8; 20]),
    WitnessV0ScriptHash([u8; 32]),
    OfflineStaking {
        staker: [u8; 20],
        owner: [u8; 20],
    },
    NullData,
    Nonstandard,
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

/// Witness program: a version byte followed by a 2..40-byte push.
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        op @ OP_1..=OP_16 => op - OP_1 + 1,
        _ => return None,
    };
    let push_len = script[1] as usize;
    if push_len != script.len() - 2 || !(2..=40).contains(&push_len) {
        return None;
    }
    Some((version, &script[2..]))
}

/// Offline-staking template:
/// `DUP HASH160 ROT IF CHECKOFFLINESTAKEVERIFY <staker> ELSE <owner> ENDIF
///  EQUALVERIFY CHECKSIG`.
pub fn is_offline_staking(script: &[u8]) -> Option<([u8; 20], [u8; 20])> {
    let stripped = strip_token_data(script);
    if stripped.len() != 51 {
        return None;
    }
    let template_ok = stripped[0] == OP_DUP
        && stripped[1] == OP_HASH160
        && stripped[2] == OP_ROT
        && stripped[3] == OP_IF
        && stripped[4] == OP_CHECKOFFLINESTAKEVERIFY
        && stripped[5] == 20
        && stripped[26] == OP_ELSE
        && stripped[27] == 20
        && stripped[48] == OP_ENDIF
        && stripped[49] == OP_EQUALVERIFY
        && stripped[50] == OP_CHECKSIG;
    if !template_ok {
        return None;
    }
    let staker: [u8; 20] = stripped[6..26].try_into().ok()?;
    let owner: [u8; 20] = stripped[28..48].try_into().ok()?;
    Some((staker, owner))
}

/// Token payloads ride behind the standard part as
/// `OP_TOKEN <push> OP_DROP`; strip them before template matching.
pub fn strip_token_data(script: &[u8]) -> &[u8] {
    if let Some(position) = find_token_marker(script) {
        &script[..position]
    } else {
        script
    }
}

/// Offset of the token marker, if the script carries a payload.
pub fn find_token_marker(script: &[u8]) -> Option<usize> {
    let mut pc = 0usize;
    while pc < script.len() {
        if script[pc] == OP_TOKEN {
            return Some(pc);
        }
        pc += match script[pc] {
            len @ 0x01..=0x4b => 1 + len as usize,
            OP_PUSHDATA1 => 2 + *script.get(pc + 1)? as usize,
            OP_PUSHDATA2 => {
                let bytes = script.get(pc + 1..pc + 3)?;
                3 + u16::from_le_bytes(bytes.try_into().ok()?) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(pc + 1..pc + 5)?;
                5 + u32::from_le_bytes(bytes.try_into().ok()?) as usize
            }
            _ => 1,
        };
    }
    None
}

pub fn classify(script: &[u8]) -> ScriptClass {
    let stripped = strip_token_data(script);
    if stripped.first() == Some(&OP_RETURN) {
        if is_push_only(&stripped[1..]) {
            return ScriptClass::NullData;
        }
        return ScriptClass::Nonstandard;
    }
    if is_p2pkh(stripped) {
        let hash: [u8; 20] = stripped[3..23].try_into().expect("length checked");
        return ScriptClass::PayToPubkeyHash(hash);
    }
    if is_p2sh(stripped) {
        let hash: [u8; 20] = stripped[2..22].try_into().expect("length checked");
        return ScriptClass::PayToScriptHash(hash);
    }
    if let Some((version, program)) = witness_program(stripped) {
        if version == 0 {
            if program.len() == 20 {
                let hash: [u8; 20] = program.try_into().expect("length checked");
                return ScriptClass::WitnessV0KeyHash(hash);
            }
            if program.len() == 32 {
                let hash: [u8; 32] = program.try_into().expect("length checked");
                return ScriptClass::WitnessV0ScriptHash(hash);
            }
        }
        return ScriptClass::Nonstandard;
    }
    if let Some((staker, owner)) = is_offline_staking(stripped) {
        return ScriptClass::OfflineStaking { staker, owner };
    }
    // P2PK: <33|65-byte key> CHECKSIG.
    if (stripped.len() == 35 || stripped.len() == 67)
        && stripped[0] as usize == stripped.len() - 2
        && stripped[stripped.len() - 1] == OP_CHECKSIG
    {
        return ScriptClass::PayToPubkey(stripped[1..stripped.len() - 1].to_vec());
    }
    ScriptClass::Nonstandard
}

pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn pay_to_pubkey(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn pay_to_pubkey_hash_of(pubkey: &[u8]) -> Vec<u8> {
    pay_to_pubkey_hash(&hash160(pubkey))
}

pub fn offline_staking_script(staker: &[u8; 20], owner: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(51);
    script.extend_from_slice(&[
        OP_DUP,
        OP_HASH160,
        OP_ROT,
        OP_IF,
        OP_CHECKOFFLINESTAKEVERIFY,
        20,
    ]);
    script.extend_from_slice(staker);
    script.push(OP_ELSE);
    script.push(20);
    script.extend_from_slice(owner);
    script.extend_from_slice(&[OP_ENDIF, OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// Append a token payload to a base script.
pub fn with_token_data(base: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut script = base.to_vec();
    script.push(OP_TOKEN);
    push_data(&mut script, payload);
    script.push(OP_DROP);
    script
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=0x4b => script.push(data.len() as u8),
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
        }
        _ => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Legacy signature-operation count. `accurate` resolves the key count of
/// OP_CHECKMULTISIG from the preceding small-integer push.
pub fn legacy_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut pc = 0usize;
    let mut last_opcode = 0xffu8;
    while pc < script.len() {
        let opcode = script[pc];
        let skip = match opcode {
            len @ 0x01..=0x4b => len as usize,
            OP_PUSHDATA1 => 1 + script.get(pc + 1).map(|len| *len as usize).unwrap_or(0),
            OP_PUSHDATA2 => {
                let len = script
                    .get(pc + 1..pc + 3)
                    .map(|bytes| u16::from_le_bytes(bytes.try_into().unwrap_or([0; 2])) as usize)
                    .unwrap_or(0);
                2 + len
            }
            OP_PUSHDATA4 => {
                let len = script
                    .get(pc + 1..pc + 5)
                    .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])) as usize)
                    .unwrap_or(0);
                4 + len
            }
            _ => 0,
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as u32;
                } else {
                    count += 20;
                }
            }
            _ => {}
        }
        last_opcode = opcode;
        pc += 1 + skip;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::{
        classify, is_offline_staking, legacy_sigop_count, offline_staking_script,
        pay_to_pubkey_hash, strip_token_data, with_token_data, ScriptClass,
    };
    use crate::opcodes::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_2, OP_3};

    #[test]
    fn p2pkh_classifies() {
        let script = pay_to_pubkey_hash(&[7u8; 20]);
        assert_eq!(classify(&script), ScriptClass::PayToPubkeyHash([7u8; 20]));
    }

    #[test]
    fn token_suffix_does_not_change_class() {
        let base = pay_to_pubkey_hash(&[7u8; 20]);
        let script = with_token_data(&base, b"token payload");
        assert_eq!(strip_token_data(&script), base.as_slice());
        assert_eq!(classify(&script), ScriptClass::PayToPubkeyHash([7u8; 20]));
    }

    #[test]
    fn offline_staking_roundtrip() {
        let script = offline_staking_script(&[1u8; 20], &[2u8; 20]);
        let (staker, owner) = is_offline_staking(&script).expect("template");
        assert_eq!(staker, [1u8; 20]);
        assert_eq!(owner, [2u8; 20]);
        assert!(matches!(
            classify(&script),
            ScriptClass::OfflineStaking { .. }
        ));
    }

    #[test]
    fn sigop_counting_accurate_and_legacy() {
        let script = vec![OP_2, 0x01, 0xaa, 0x01, 0xbb, OP_3, OP_CHECKMULTISIG, OP_CHECKSIG];
        assert_eq!(legacy_sigop_count(&script, true), 4);
        assert_eq!(legacy_sigop_count(&script, false), 21);
    }
}
