//! Governance opcode processing.
//!
//! A transaction that spends the master governance script may carry
//! `OP_RETURN` outputs encoding freeze, cost and fee-address updates.
//! Unknown prefixes are no-ops.

use std::collections::HashMap;

use plbd_consensus::money::Amount;
use plbd_consensus::Hash256;
use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use plbd_primitives::hash::sha256;
use plbd_script::opcodes::OP_RETURN;
use plbd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const GOVERNANCE_MARKER: u8 = 0xc9;
pub const GOVERNANCE_ACTION: u8 = 0x01;

const OP_FREEZE: u8 = 0x01;
const OP_UNFREEZE: u8 = 0x02;
const OP_COST: u8 = 0x03;
const OP_FEE_SCRIPT: u8 = 0x04;

/// Token classes whose issuance cost governance may update.
pub const COST_CLASS_ROOT: u8 = 1;
pub const COST_CLASS_SUB: u8 = 2;
pub const COST_CLASS_UNIQUE: u8 = 3;
pub const COST_CLASS_QUALIFIER: u8 = 4;
pub const COST_CLASS_RESTRICTED: u8 = 5;

const FROZEN_PREFIX: u8 = b'f';
const COST_PREFIX: u8 = b'c';
const FEE_SCRIPT_KEY: &[u8] = b"fee_script";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GovernanceOp {
    Freeze { script: Vec<u8> },
    Unfreeze { script: Vec<u8> },
    UpdateCost { class: u8, amount: Amount },
    UpdateFeeScript { script: Vec<u8> },
}

/// Decode one output script into a governance operation. Outputs that are
/// not governance-shaped, and governance-shaped outputs with an unknown
/// action byte, decode to `None`.
pub fn decode_governance_op(script: &[u8]) -> Option<GovernanceOp> {
    if script.len() < 5 || script[0] != OP_RETURN {
        return None;
    }
    if script[2] != GOVERNANCE_MARKER || script[3] != GOVERNANCE_ACTION {
        return None;
    }
    match script[4] {
        OP_FREEZE | OP_UNFREEZE | OP_FEE_SCRIPT => {
            let length = *script.get(5)? as usize;
            let payload = script.get(6..6 + length)?;
            if script.len() != 6 + length {
                return None;
            }
            let target = payload.to_vec();
            Some(match script[4] {
                OP_FREEZE => GovernanceOp::Freeze { script: target },
                OP_UNFREEZE => GovernanceOp::Unfreeze { script: target },
                _ => GovernanceOp::UpdateFeeScript { script: target },
            })
        }
        OP_COST => {
            if script.len() != 14 {
                return None;
            }
            let class = script[5];
            if !(COST_CLASS_ROOT..=COST_CLASS_RESTRICTED).contains(&class) {
                return None;
            }
            let amount = i64::from_le_bytes(script[6..14].try_into().ok()?);
            Some(GovernanceOp::UpdateCost { class, amount })
        }
        _ => None,
    }
}

/// Build a governance output script; block templates and tests use it.
pub fn encode_governance_op(op: &GovernanceOp) -> Vec<u8> {
    let mut script = vec![OP_RETURN, 0x00, GOVERNANCE_MARKER, GOVERNANCE_ACTION];
    match op {
        GovernanceOp::Freeze { script: target } => {
            script.push(OP_FREEZE);
            script.push(target.len() as u8);
            script.extend_from_slice(target);
        }
        GovernanceOp::Unfreeze { script: target } => {
            script.push(OP_UNFREEZE);
            script.push(target.len() as u8);
            script.extend_from_slice(target);
        }
        GovernanceOp::UpdateCost { class, amount } => {
            script.push(OP_COST);
            script.push(*class);
            script.extend_from_slice(&amount.to_le_bytes());
        }
        GovernanceOp::UpdateFeeScript { script: target } => {
            script.push(OP_FEE_SCRIPT);
            script.push(target.len() as u8);
            script.extend_from_slice(target);
        }
    }
    script
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GovernanceUndoOp {
    SetFrozen { script_hash: Hash256, frozen: bool },
    SetCost { class: u8, previous: Option<Amount> },
    SetFeeScript { previous: Option<Vec<u8>> },
}

impl GovernanceUndoOp {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        match self {
            GovernanceUndoOp::SetFrozen {
                script_hash,
                frozen,
            } => {
                encoder.write_u8(0);
                encoder.write_bytes(script_hash);
                encoder.write_u8(*frozen as u8);
            }
            GovernanceUndoOp::SetCost { class, previous } => {
                encoder.write_u8(1);
                encoder.write_u8(*class);
                match previous {
                    Some(amount) => {
                        encoder.write_u8(1);
                        encoder.write_i64_le(*amount);
                    }
                    None => encoder.write_u8(0),
                }
            }
            GovernanceUndoOp::SetFeeScript { previous } => {
                encoder.write_u8(2);
                match previous {
                    Some(script) => {
                        encoder.write_u8(1);
                        encoder.write_var_bytes(script);
                    }
                    None => encoder.write_u8(0),
                }
            }
        }
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            0 => Ok(GovernanceUndoOp::SetFrozen {
                script_hash: decoder.read_fixed::<32>()?,
                frozen: decoder.read_u8()? != 0,
            }),
            1 => {
                let class = decoder.read_u8()?;
                let previous = if decoder.read_u8()? != 0 {
                    Some(decoder.read_i64_le()?)
                } else {
                    None
                };
                Ok(GovernanceUndoOp::SetCost { class, previous })
            }
            2 => {
                let previous = if decoder.read_u8()? != 0 {
                    Some(decoder.read_var_bytes()?)
                } else {
                    None
                };
                Ok(GovernanceUndoOp::SetFeeScript { previous })
            }
            _ => Err(DecodeError::TrailingBytes),
        }
    }
}

fn frozen_key(script_hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(FROZEN_PREFIX);
    key.extend_from_slice(script_hash);
    key
}

fn cost_key(class: u8) -> [u8; 2] {
    [COST_PREFIX, class]
}

/// Pending governance mutations for one block, staged on top of the
/// store and committed with the block's batch.
#[derive(Default)]
pub struct GovernanceCache {
    frozen: HashMap<Hash256, bool>,
    costs: HashMap<u8, Option<Amount>>,
    fee_script: Option<Option<Vec<u8>>>,
}

impl GovernanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frozen.is_empty() && self.costs.is_empty() && self.fee_script.is_none()
    }

    pub fn script_frozen<S: KeyValueStore>(
        &self,
        store: &S,
        script: &[u8],
    ) -> Result<bool, StoreError> {
        let hash = sha256(script);
        if let Some(frozen) = self.frozen.get(&hash) {
            return Ok(*frozen);
        }
        Ok(store.get(Column::Governance, &frozen_key(&hash))?.is_some())
    }

    pub fn issuance_cost<S: KeyValueStore>(
        &self,
        store: &S,
        class: u8,
        default: Amount,
    ) -> Result<Amount, StoreError> {
        if let Some(cost) = self.costs.get(&class) {
            return Ok(cost.unwrap_or(default));
        }
        match store.get(Column::Governance, &cost_key(class))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| StoreError::Backend("corrupt governance cost".to_string()))?;
                Ok(i64::from_le_bytes(bytes))
            }
            None => Ok(default),
        }
    }

    pub fn fee_script<S: KeyValueStore>(
        &self,
        store: &S,
        default: &[u8],
    ) -> Result<Vec<u8>, StoreError> {
        if let Some(pending) = &self.fee_script {
            return Ok(pending.clone().unwrap_or_else(|| default.to_vec()));
        }
        match store.get(Column::Governance, FEE_SCRIPT_KEY)? {
            Some(bytes) => Ok(bytes),
            None => Ok(default.to_vec()),
        }
    }

    /// Apply one op, returning the reversal entry.
    pub fn apply<S: KeyValueStore>(
        &mut self,
        store: &S,
        op: &GovernanceOp,
    ) -> Result<GovernanceUndoOp, StoreError> {
        match op {
            GovernanceOp::Freeze { script } | GovernanceOp::Unfreeze { script } => {
                let frozen = matches!(op, GovernanceOp::Freeze { .. });
                let hash = sha256(script);
                let previous = self.script_frozen(store, script)?;
                self.frozen.insert(hash, frozen);
                Ok(GovernanceUndoOp::SetFrozen {
                    script_hash: hash,
                    frozen: previous,
                })
            }
            GovernanceOp::UpdateCost { class, amount } => {
                let previous = match self.costs.get(class) {
                    Some(pending) => *pending,
                    None => store
                        .get(Column::Governance, &cost_key(*class))?
                        .map(|bytes| {
                            let bytes: [u8; 8] = bytes.try_into().unwrap_or([0u8; 8]);
                            i64::from_le_bytes(bytes)
                        }),
                };
                self.costs.insert(*class, Some(*amount));
                Ok(GovernanceUndoOp::SetCost {
                    class: *class,
                    previous,
                })
            }
            GovernanceOp::UpdateFeeScript { script } => {
                let previous = match &self.fee_script {
                    Some(pending) => pending.clone(),
                    None => store.get(Column::Governance, FEE_SCRIPT_KEY)?,
                };
                self.fee_script = Some(Some(script.clone()));
                Ok(GovernanceUndoOp::SetFeeScript { previous })
            }
        }
    }

    /// Apply a reversal from an undo record.
    pub fn apply_undo(&mut self, op: &GovernanceUndoOp) {
        match op {
            GovernanceUndoOp::SetFrozen {
                script_hash,
                frozen,
            } => {
                self.frozen.insert(*script_hash, *frozen);
            }
            GovernanceUndoOp::SetCost { class, previous } => {
                self.costs.insert(*class, *previous);
            }
            GovernanceUndoOp::SetFeeScript { previous } => {
                self.fee_script = Some(previous.clone());
            }
        }
    }

    pub fn write_to_batch(&mut self, batch: &mut WriteBatch) {
        for (hash, frozen) in self.frozen.drain() {
            let key = frozen_key(&hash);
            if frozen {
                batch.put(Column::Governance, key, Vec::new());
            } else {
                batch.delete(Column::Governance, key);
            }
        }
        for (class, cost) in self.costs.drain() {
            let key = cost_key(class);
            match cost {
                Some(amount) => batch.put(Column::Governance, key, amount.to_le_bytes().to_vec()),
                None => batch.delete(Column::Governance, key),
            }
        }
        if let Some(fee_script) = self.fee_script.take() {
            match fee_script {
                Some(script) => batch.put(Column::Governance, FEE_SCRIPT_KEY, script),
                None => batch.delete(Column::Governance, FEE_SCRIPT_KEY),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_governance_op, encode_governance_op, GovernanceCache, GovernanceOp};
    use plbd_storage::memory::MemoryStore;
    use plbd_storage::KeyValueStore;

    #[test]
    fn op_roundtrip() {
        let ops = vec![
            GovernanceOp::Freeze {
                script: vec![0x76, 0xa9],
            },
            GovernanceOp::UpdateCost {
                class: super::COST_CLASS_SUB,
                amount: 42,
            },
            GovernanceOp::UpdateFeeScript {
                script: vec![0x51],
            },
        ];
        for op in ops {
            let script = encode_governance_op(&op);
            assert_eq!(decode_governance_op(&script), Some(op));
        }
    }

    #[test]
    fn unknown_action_is_noop() {
        let mut script = encode_governance_op(&GovernanceOp::Freeze {
            script: vec![0x51],
        });
        script[4] = 0x7f;
        assert_eq!(decode_governance_op(&script), None);
    }

    #[test]
    fn freeze_apply_and_revert() {
        let store = MemoryStore::new();
        let mut cache = GovernanceCache::new();
        let target = vec![0x76, 0xa9, 0x14];

        let undo = cache
            .apply(&store, &GovernanceOp::Freeze {
                script: target.clone(),
            })
            .expect("apply");
        assert!(cache.script_frozen(&store, &target).expect("frozen"));

        let mut batch = plbd_storage::WriteBatch::new();
        cache.write_to_batch(&mut batch);
        store.write_batch(&batch).expect("commit");

        let mut revert = GovernanceCache::new();
        assert!(revert.script_frozen(&store, &target).expect("frozen"));
        revert.apply_undo(&undo);
        assert!(!revert.script_frozen(&store, &target).expect("frozen"));
    }
}
