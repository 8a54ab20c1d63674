//! Token rule application during block connect.
//!
//! Spending a token-carrying coin debits its owner's balance; outputs
//! issue, reissue or move tokens. Every mutation records its reversal for
//! the block undo record.

use std::collections::HashMap;

use plbd_consensus::params::ChainParams;
use plbd_primitives::{Coin, Transaction};
use plbd_script::{classify, ScriptClass};
use plbd_storage::KeyValueStore;
use plbd_tokens::data::OWNERSHIP_AMOUNT;
use plbd_tokens::state::script_owner_hash;
use plbd_tokens::{
    parse_token_null_op, parse_token_script, token_class, IssuanceRecord, TokenCache, TokenClass,
    TokenError, TokenNullOp, TokenScript, TokenUndoOp, TokenView,
};

use crate::governance::{
    GovernanceCache, COST_CLASS_QUALIFIER, COST_CLASS_RESTRICTED, COST_CLASS_ROOT, COST_CLASS_SUB,
    COST_CLASS_UNIQUE,
};
use crate::validation::{ChainError, REJECT_INVALID};

fn issuance_cost_class(class: TokenClass) -> Option<u8> {
    match class {
        TokenClass::Root => Some(COST_CLASS_ROOT),
        TokenClass::Sub => Some(COST_CLASS_SUB),
        TokenClass::Unique => Some(COST_CLASS_UNIQUE),
        TokenClass::Qualifier | TokenClass::SubQualifier => Some(COST_CLASS_QUALIFIER),
        TokenClass::Restricted => Some(COST_CLASS_RESTRICTED),
        TokenClass::Ownership => None,
    }
}

fn default_cost(params: &ChainParams, class: u8) -> i64 {
    match class {
        COST_CLASS_ROOT => params.issuance_cost_root,
        COST_CLASS_SUB => params.issuance_cost_sub,
        COST_CLASS_UNIQUE => params.issuance_cost_unique,
        COST_CLASS_QUALIFIER => params.issuance_cost_qualifier,
        _ => params.issuance_cost_restricted,
    }
}

/// The base token of a name: strips the `!`, `#` and `$` decorations.
fn root_of(name: &str) -> &str {
    let name = name.strip_prefix('#').unwrap_or(name);
    let name = name.strip_prefix('$').unwrap_or(name);
    let name = name.strip_suffix('!').unwrap_or(name);
    name.split('#').next().unwrap_or(name)
}

fn ownership_name(name: &str) -> String {
    format!("{}!", root_of(name).split('/').next().unwrap_or(name))
}

/// Destination key hash for freeze and qualifier checks, when the output
/// pays a single key.
fn destination_hash(script_pubkey: &[u8]) -> Option<[u8; 20]> {
    match classify(script_pubkey) {
        ScriptClass::PayToPubkeyHash(hash) | ScriptClass::WitnessV0KeyHash(hash) => Some(hash),
        ScriptClass::OfflineStaking { owner, .. } => Some(owner),
        _ => None,
    }
}

fn invalid(reason: impl Into<String>) -> ChainError {
    ChainError::invalid(REJECT_INVALID, reason)
}

/// Apply one transaction's token effects. `spent_coins` are the input
/// coins in input order (empty for coinbases).
#[allow(clippy::too_many_arguments)]
pub fn apply_token_tx<S: KeyValueStore, P: TokenView>(
    store: &S,
    governance: &GovernanceCache,
    params: &ChainParams,
    tokens: &mut TokenCache<P>,
    tx: &Transaction,
    spent_coins: &[Coin],
    height: i32,
    undo: &mut Vec<TokenUndoOp>,
) -> Result<(), ChainError> {
    if height < params.consensus.tokens_height {
        return Ok(());
    }

    // Inputs: debit the spending owner, track per-token totals and the
    // authority tokens this transaction controls.
    let mut token_in: HashMap<String, i64> = HashMap::new();
    let mut spends_ownership: HashMap<String, bool> = HashMap::new();
    for coin in spent_coins {
        let Some(payload) =
            parse_token_script(&coin.script_pubkey).map_err(ChainError::from)?
        else {
            continue;
        };
        let name = payload.name().to_string();
        let amount = payload.amount();
        let owner = script_owner_hash(&coin.script_pubkey);
        tokens.credit(&name, &owner, -amount)?;
        undo.push(TokenUndoOp::Credit {
            name: name.clone(),
            owner,
            amount,
        });
        *token_in.entry(name.clone()).or_insert(0) += amount;
        if name.ends_with('!') {
            spends_ownership.insert(name, true);
        }
    }

    let mut token_out: HashMap<String, i64> = HashMap::new();
    let mut minted: HashMap<String, i64> = HashMap::new();
    let mut fee_paid: i64 = 0;
    let fee_script = governance
        .fee_script(store, &params.issuance_fee_script)
        .map_err(ChainError::from)?;
    for output in &tx.vout {
        if output.script_pubkey == fee_script.as_slice() {
            fee_paid = fee_paid.saturating_add(output.value);
        }
    }

    // Names issued by this transaction; ownership mints must accompany
    // their root issuance.
    let mut issues_in_tx: HashMap<String, bool> = HashMap::new();
    for output in &tx.vout {
        if let Ok(Some(TokenScript::Issue { name, .. })) =
            parse_token_script(&output.script_pubkey)
        {
            issues_in_tx.insert(name, true);
        }
    }

    for output in &tx.vout {
        if let Some(null_op) =
            parse_token_null_op(&output.script_pubkey).map_err(ChainError::from)?
        {
            apply_null_op(params, tokens, &null_op, &spends_ownership, height, undo)?;
            continue;
        }
        let Some(payload) =
            parse_token_script(&output.script_pubkey).map_err(ChainError::from)?
        else {
            continue;
        };
        let owner = script_owner_hash(&output.script_pubkey);
        match payload {
            TokenScript::Issue {
                name,
                amount,
                units,
                reissuable,
                ipfs,
            } => {
                let class = token_class(&name).map_err(ChainError::from)?;
                if matches!(class, TokenClass::Ownership) {
                    return Err(invalid(format!("bad-token-issue-ownership-{name}")));
                }
                if amount <= 0 || units > plbd_tokens::data::MAX_TOKEN_UNITS {
                    return Err(invalid(format!("bad-token-issue-amount-{name}")));
                }
                if tokens.issuance(&name)?.is_some() {
                    return Err(invalid(format!("token-already-issued-{name}")));
                }
                if matches!(class, TokenClass::Restricted)
                    && height < params.consensus.restricted_tokens_height
                {
                    return Err(invalid(format!("token-restricted-too-early-{name}")));
                }
                // Sub-level and restricted issuance needs the root
                // ownership token among the inputs; root issuance mints
                // its ownership token in the same transaction.
                let needs_authority = !matches!(class, TokenClass::Root | TokenClass::Qualifier);
                if needs_authority && !spends_ownership.contains_key(&ownership_name(&name)) {
                    return Err(invalid(format!("token-missing-owner-input-{name}")));
                }
                if let Some(cost_class) = issuance_cost_class(class) {
                    let cost = governance
                        .issuance_cost(store, cost_class, default_cost(params, cost_class))
                        .map_err(ChainError::from)?;
                    if !fee_script.is_empty() && fee_paid < cost {
                        return Err(invalid(format!("token-issue-fee-not-paid-{name}")));
                    }
                }
                tokens.set_issuance(IssuanceRecord {
                    name: name.clone(),
                    amount,
                    units,
                    reissuable,
                    ipfs,
                    height,
                });
                undo.push(TokenUndoOp::RemoveIssuance { name: name.clone() });
                tokens.credit(&name, &owner, amount)?;
                undo.push(TokenUndoOp::Debit {
                    name,
                    owner,
                    amount,
                });
            }
            TokenScript::Ownership { name } => {
                if !name.ends_with('!') {
                    return Err(invalid(format!("bad-token-owner-name-{name}")));
                }
                let root = name.trim_end_matches('!');
                if !issues_in_tx.contains_key(root) {
                    return Err(invalid(format!("token-owner-without-issue-{name}")));
                }
                tokens.credit(&name, &owner, OWNERSHIP_AMOUNT)?;
                undo.push(TokenUndoOp::Debit {
                    name: name.clone(),
                    owner,
                    amount: OWNERSHIP_AMOUNT,
                });
                *minted.entry(name).or_insert(0) += OWNERSHIP_AMOUNT;
            }
            TokenScript::Reissue {
                name,
                amount,
                units,
                reissuable,
                ipfs,
            } => {
                let record = tokens
                    .issuance(&name)?
                    .ok_or_else(|| invalid(format!("token-unknown-{name}")))?;
                if !record.reissuable {
                    return Err(invalid(format!("token-not-reissuable-{name}")));
                }
                if !spends_ownership.contains_key(&ownership_name(&name)) {
                    return Err(invalid(format!("token-missing-owner-input-{name}")));
                }
                if amount < 0 || units < record.units {
                    return Err(invalid(format!("bad-token-reissue-{name}")));
                }
                let mut updated = record.clone();
                updated.amount = record
                    .amount
                    .checked_add(amount)
                    .ok_or_else(|| invalid(format!("bad-token-reissue-amount-{name}")))?;
                updated.units = units.max(record.units);
                updated.reissuable = reissuable;
                if ipfs.is_some() {
                    updated.ipfs = ipfs;
                }
                tokens.set_issuance(updated);
                undo.push(TokenUndoOp::RestoreIssuance { record });
                if amount > 0 {
                    tokens.credit(&name, &owner, amount)?;
                    undo.push(TokenUndoOp::Debit {
                        name: name.clone(),
                        owner,
                        amount,
                    });
                    *minted.entry(name.clone()).or_insert(0) += amount;
                }
            }
            TokenScript::Transfer { name, amount } => {
                if amount <= 0 {
                    return Err(invalid(format!("bad-token-amount-{name}")));
                }
                if tokens.issuance(&name)?.is_none() && !name.ends_with('!') {
                    return Err(invalid(format!("token-unknown-{name}")));
                }
                check_restriction(tokens, &name, &output.script_pubkey)?;
                tokens.credit(&name, &owner, amount)?;
                undo.push(TokenUndoOp::Debit {
                    name: name.clone(),
                    owner,
                    amount,
                });
                *token_out.entry(name).or_insert(0) += amount;
            }
        }
    }

    // Transfers conserve: outputs of a token may not exceed its inputs.
    for (name, out_amount) in &token_out {
        let available = token_in.get(name).copied().unwrap_or(0)
            + minted.get(name).copied().unwrap_or(0);
        if *out_amount > available {
            return Err(invalid(format!("bad-token-transfer-{name}")));
        }
    }
    Ok(())
}

fn check_restriction<P: TokenView>(
    tokens: &mut TokenCache<P>,
    name: &str,
    script_pubkey: &[u8],
) -> Result<(), ChainError> {
    if !name.starts_with('$') {
        return Ok(());
    }
    if tokens.global_frozen(name)? {
        return Err(invalid(format!("token-globally-frozen-{name}")));
    }
    let Some(destination) = destination_hash(script_pubkey) else {
        return Ok(());
    };
    if tokens.address_frozen(name, &destination)? {
        return Err(invalid(format!("token-address-frozen-{name}")));
    }
    if let Some(verifier) = tokens.verifier(name)? {
        if verifier != "true" && !tokens.has_qualifier(&verifier, &destination)? {
            return Err(invalid(format!("token-verifier-failed-{name}")));
        }
    }
    Ok(())
}

fn apply_null_op<P: TokenView>(
    params: &ChainParams,
    tokens: &mut TokenCache<P>,
    op: &TokenNullOp,
    spends_ownership: &HashMap<String, bool>,
    height: i32,
    undo: &mut Vec<TokenUndoOp>,
) -> Result<(), ChainError> {
    if height < params.consensus.restricted_tokens_height {
        return Err(invalid("token-restricted-too-early"));
    }
    let authority = ownership_name(op.token_name());
    if !spends_ownership.contains_key(&authority) {
        return Err(invalid(format!(
            "token-missing-owner-input-{}",
            op.token_name()
        )));
    }
    match op {
        TokenNullOp::QualifyAddress {
            qualifier,
            address,
            add,
        } => {
            if token_class(qualifier).map_err(ChainError::from)?
                != TokenClass::Qualifier
            {
                return Err(invalid(format!("bad-qualifier-name-{qualifier}")));
            }
            let previous = tokens.set_qualifier(qualifier, address, *add)?;
            undo.push(TokenUndoOp::SetQualifier {
                qualifier: qualifier.clone(),
                address: *address,
                present: previous,
            });
        }
        TokenNullOp::FreezeAddress {
            token,
            address,
            freeze,
        } => {
            let previous = tokens.set_address_freeze(token, address, *freeze)?;
            undo.push(TokenUndoOp::SetAddressFreeze {
                token: token.clone(),
                address: *address,
                frozen: previous,
            });
        }
        TokenNullOp::GlobalFreeze { token, freeze } => {
            let previous = tokens.set_global_freeze(token, *freeze)?;
            undo.push(TokenUndoOp::SetGlobalFreeze {
                token: token.clone(),
                frozen: previous,
            });
        }
        TokenNullOp::Verifier { token, verifier } => {
            let previous = tokens.set_verifier(token, Some(verifier.clone()))?;
            undo.push(TokenUndoOp::SetVerifier {
                token: token.clone(),
                verifier: previous,
            });
        }
    }
    Ok(())
}

/// Reverse a block's token effects; ops recorded in connect order are
/// applied backwards.
pub fn undo_token_ops<P: TokenView>(
    tokens: &mut TokenCache<P>,
    ops: &[TokenUndoOp],
) -> Result<(), TokenError> {
    for op in ops.iter().rev() {
        op.apply(tokens)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply_token_tx, undo_token_ops};
    use crate::governance::GovernanceCache;
    use plbd_consensus::{chain_params, Network};
    use plbd_primitives::{Coin, OutPoint, Transaction, TxIn, TxOut};
    use plbd_script::standard::{pay_to_pubkey_hash, with_token_data};
    use plbd_storage::memory::MemoryStore;
    use plbd_tokens::data::OWNERSHIP_AMOUNT;
    use plbd_tokens::state::script_owner_hash;
    use plbd_tokens::{TokenCache, TokenScript, TokenView, TokensDb};

    fn tx_with_outputs(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 2,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [1u8; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    fn token_out(base_hash: [u8; 20], payload: &TokenScript, value: i64) -> TxOut {
        TxOut {
            value,
            script_pubkey: with_token_data(&pay_to_pubkey_hash(&base_hash), &payload.encode()),
        }
    }

    #[test]
    fn issue_transfer_and_undo_roundtrip() {
        let params = chain_params(Network::Regtest);
        let store = MemoryStore::new();
        let governance = GovernanceCache::new();
        let mut db = TokensDb::new(&store);
        let mut tokens = TokenCache::new(&mut db);
        let mut undo = Vec::new();

        // Issue PLBGOLD together with its ownership token.
        let issue = tx_with_outputs(vec![
            token_out(
                [7u8; 20],
                &TokenScript::Issue {
                    name: "PLBGOLD".to_string(),
                    amount: 1_000,
                    units: 0,
                    reissuable: true,
                    ipfs: None,
                },
                0,
            ),
            token_out(
                [7u8; 20],
                &TokenScript::Ownership {
                    name: "PLBGOLD!".to_string(),
                },
                0,
            ),
        ]);
        apply_token_tx(
            &store, &governance, &params, &mut tokens, &issue, &[], 10, &mut undo,
        )
        .expect("issue applies");

        let owner = script_owner_hash(&issue.vout[0].script_pubkey);
        assert_eq!(tokens.balance("PLBGOLD", &owner).expect("balance"), 1_000);
        assert_eq!(
            tokens
                .balance("PLBGOLD!", &script_owner_hash(&issue.vout[1].script_pubkey))
                .expect("balance"),
            OWNERSHIP_AMOUNT
        );

        // Transfer 400 to a new owner, spending the issue output.
        let spent_coin = Coin {
            value: 0,
            script_pubkey: issue.vout[0].script_pubkey.clone(),
            height: 10,
            is_coinbase: false,
            is_coinstake: false,
            time: 0,
        };
        let transfer = tx_with_outputs(vec![
            token_out(
                [8u8; 20],
                &TokenScript::Transfer {
                    name: "PLBGOLD".to_string(),
                    amount: 400,
                },
                0,
            ),
            token_out(
                [7u8; 20],
                &TokenScript::Transfer {
                    name: "PLBGOLD".to_string(),
                    amount: 600,
                },
                0,
            ),
        ]);
        let mut transfer_undo = Vec::new();
        apply_token_tx(
            &store,
            &governance,
            &params,
            &mut tokens,
            &transfer,
            std::slice::from_ref(&spent_coin),
            11,
            &mut transfer_undo,
        )
        .expect("transfer applies");
        let new_owner = script_owner_hash(&transfer.vout[0].script_pubkey);
        assert_eq!(tokens.balance("PLBGOLD", &new_owner).expect("balance"), 400);
        assert_eq!(tokens.balance("PLBGOLD", &owner).expect("balance"), 600);

        // Undo the transfer: balances return to the issue state.
        undo_token_ops(&mut tokens, &transfer_undo).expect("undo");
        assert_eq!(tokens.balance("PLBGOLD", &new_owner).expect("balance"), 0);
        assert_eq!(tokens.balance("PLBGOLD", &owner).expect("balance"), 1_000);
    }

    #[test]
    fn transfer_may_not_exceed_inputs() {
        let params = chain_params(Network::Regtest);
        let store = MemoryStore::new();
        let governance = GovernanceCache::new();
        let mut db = TokensDb::new(&store);
        let mut tokens = TokenCache::new(&mut db);
        let mut undo = Vec::new();

        let issue = tx_with_outputs(vec![token_out(
            [7u8; 20],
            &TokenScript::Issue {
                name: "PLBGOLD".to_string(),
                amount: 100,
                units: 0,
                reissuable: false,
                ipfs: None,
            },
            0,
        )]);
        apply_token_tx(
            &store, &governance, &params, &mut tokens, &issue, &[], 10, &mut undo,
        )
        .expect("issue applies");

        let spent_coin = Coin {
            value: 0,
            script_pubkey: issue.vout[0].script_pubkey.clone(),
            height: 10,
            is_coinbase: false,
            is_coinstake: false,
            time: 0,
        };
        let overspend = tx_with_outputs(vec![token_out(
            [8u8; 20],
            &TokenScript::Transfer {
                name: "PLBGOLD".to_string(),
                amount: 250,
            },
            0,
        )]);
        let mut undo = Vec::new();
        let result = apply_token_tx(
            &store,
            &governance,
            &params,
            &mut tokens,
            &overspend,
            std::slice::from_ref(&spent_coin),
            11,
            &mut undo,
        );
        assert!(result.is_err());
    }
}
