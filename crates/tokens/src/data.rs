//! Token payload decoding.
//!
//! Token operations ride on transaction outputs: a standard script followed
//! by `OP_TOKEN <payload> OP_DROP`, or a bare `OP_TOKEN <payload>` null
//! output for the restriction side-channel. Payloads start with the `plb`
//! marker and a type byte.

use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use plbd_script::opcodes::OP_TOKEN;
use plbd_script::standard::find_token_marker;

pub const TOKEN_MARKER: &[u8; 3] = b"plb";

const TYPE_ISSUE: u8 = b'q';
const TYPE_REISSUE: u8 = b'r';
const TYPE_OWNERSHIP: u8 = b'o';
const TYPE_TRANSFER: u8 = b't';
const TYPE_QUALIFY_ADDRESS: u8 = b'a';
const TYPE_FREEZE_ADDRESS: u8 = b'f';
const TYPE_GLOBAL_FREEZE: u8 = b'g';
const TYPE_VERIFIER: u8 = b'v';

pub const MAX_TOKEN_NAME_LEN: usize = 30;
pub const MIN_TOKEN_NAME_LEN: usize = 3;
/// Every ownership token represents exactly one indivisible unit.
pub const OWNERSHIP_AMOUNT: i64 = 100_000_000;
pub const MAX_TOKEN_UNITS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Store(String),
    Malformed,
    InvalidName,
    InvalidAmount,
    InvalidUnits,
    UnknownToken(String),
    DuplicateIssue(String),
    NotReissuable(String),
    MissingOwnership(String),
    TransferImbalance(String),
    Frozen(String),
    VerifierMissing(String),
    FeeNotPaid(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Store(message) => write!(f, "{message}"),
            TokenError::Malformed => write!(f, "malformed token payload"),
            TokenError::InvalidName => write!(f, "invalid token name"),
            TokenError::InvalidAmount => write!(f, "invalid token amount"),
            TokenError::InvalidUnits => write!(f, "invalid token units"),
            TokenError::UnknownToken(name) => write!(f, "unknown token {name}"),
            TokenError::DuplicateIssue(name) => write!(f, "token {name} already issued"),
            TokenError::NotReissuable(name) => write!(f, "token {name} is not reissuable"),
            TokenError::MissingOwnership(name) => {
                write!(f, "operation on {name} lacks ownership input")
            }
            TokenError::TransferImbalance(name) => {
                write!(f, "token {name} inputs do not match outputs")
            }
            TokenError::Frozen(name) => write!(f, "token {name} is frozen for this address"),
            TokenError::VerifierMissing(name) => {
                write!(f, "restricted token {name} lacks a verifier string")
            }
            TokenError::FeeNotPaid(name) => write!(f, "issuance fee not paid for {name}"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<plbd_storage::StoreError> for TokenError {
    fn from(err: plbd_storage::StoreError) -> Self {
        TokenError::Store(err.to_string())
    }
}

impl From<DecodeError> for TokenError {
    fn from(_: DecodeError) -> Self {
        TokenError::Malformed
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenClass {
    Root,
    Sub,
    Unique,
    Ownership,
    Qualifier,
    SubQualifier,
    Restricted,
}

/// Classify and validate a token name. Root names are upper-case
/// alphanumerics with dots and underscores; `/` introduces sub-tokens,
/// `#` unique tags, a trailing `!` the ownership token, a leading `#`
/// qualifiers and a leading `$` restricted tokens.
pub fn token_class(name: &str) -> Result<TokenClass, TokenError> {
    if name.len() > MAX_TOKEN_NAME_LEN {
        return Err(TokenError::InvalidName);
    }
    if let Some(base) = name.strip_suffix('!') {
        validate_root_path(base)?;
        return Ok(TokenClass::Ownership);
    }
    if let Some(rest) = name.strip_prefix('$') {
        validate_root(rest)?;
        return Ok(TokenClass::Restricted);
    }
    if let Some(rest) = name.strip_prefix('#') {
        let mut parts = rest.split('/');
        let root = parts.next().ok_or(TokenError::InvalidName)?;
        validate_root(root)?;
        let mut sub = false;
        for part in parts {
            validate_root(part)?;
            sub = true;
        }
        return Ok(if sub {
            TokenClass::SubQualifier
        } else {
            TokenClass::Qualifier
        });
    }
    if let Some((base, tag)) = name.split_once('#') {
        validate_root_path(base)?;
        if tag.is_empty() || tag.len() > MAX_TOKEN_NAME_LEN {
            return Err(TokenError::InvalidName);
        }
        return Ok(TokenClass::Unique);
    }
    if name.contains('/') {
        validate_root_path(name)?;
        return Ok(TokenClass::Sub);
    }
    validate_root(name)?;
    Ok(TokenClass::Root)
}

fn validate_root_path(name: &str) -> Result<(), TokenError> {
    for part in name.split('/') {
        validate_root(part)?;
    }
    Ok(())
}

fn validate_root(name: &str) -> Result<(), TokenError> {
    if name.len() < MIN_TOKEN_NAME_LEN || name.len() > MAX_TOKEN_NAME_LEN {
        return Err(TokenError::InvalidName);
    }
    let bytes = name.as_bytes();
    if bytes[0] == b'_' || bytes[0] == b'.' || bytes[bytes.len() - 1] == b'_'
        || bytes[bytes.len() - 1] == b'.'
    {
        return Err(TokenError::InvalidName);
    }
    for byte in bytes {
        let ok = byte.is_ascii_uppercase() || byte.is_ascii_digit() || *byte == b'_' || *byte == b'.';
        if !ok {
            return Err(TokenError::InvalidName);
        }
    }
    Ok(())
}

/// A token operation attached to a value-carrying output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenScript {
    Issue {
        name: String,
        amount: i64,
        units: u8,
        reissuable: bool,
        ipfs: Option<Vec<u8>>,
    },
    Ownership {
        name: String,
    },
    Reissue {
        name: String,
        amount: i64,
        units: u8,
        reissuable: bool,
        ipfs: Option<Vec<u8>>,
    },
    Transfer {
        name: String,
        amount: i64,
    },
}

impl TokenScript {
    pub fn name(&self) -> &str {
        match self {
            TokenScript::Issue { name, .. }
            | TokenScript::Ownership { name }
            | TokenScript::Reissue { name, .. }
            | TokenScript::Transfer { name, .. } => name,
        }
    }

    /// Token units carried by the output this payload is attached to.
    pub fn amount(&self) -> i64 {
        match self {
            TokenScript::Issue { amount, .. }
            | TokenScript::Reissue { amount, .. }
            | TokenScript::Transfer { amount, .. } => *amount,
            TokenScript::Ownership { .. } => OWNERSHIP_AMOUNT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(TOKEN_MARKER);
        match self {
            TokenScript::Issue {
                name,
                amount,
                units,
                reissuable,
                ipfs,
            } => {
                encoder.write_u8(TYPE_ISSUE);
                encoder.write_var_bytes(name.as_bytes());
                encoder.write_i64_le(*amount);
                encoder.write_u8(*units);
                encoder.write_u8(*reissuable as u8);
                write_optional_bytes(&mut encoder, ipfs.as_deref());
            }
            TokenScript::Ownership { name } => {
                encoder.write_u8(TYPE_OWNERSHIP);
                encoder.write_var_bytes(name.as_bytes());
            }
            TokenScript::Reissue {
                name,
                amount,
                units,
                reissuable,
                ipfs,
            } => {
                encoder.write_u8(TYPE_REISSUE);
                encoder.write_var_bytes(name.as_bytes());
                encoder.write_i64_le(*amount);
                encoder.write_u8(*units);
                encoder.write_u8(*reissuable as u8);
                write_optional_bytes(&mut encoder, ipfs.as_deref());
            }
            TokenScript::Transfer { name, amount } => {
                encoder.write_u8(TYPE_TRANSFER);
                encoder.write_var_bytes(name.as_bytes());
                encoder.write_i64_le(*amount);
            }
        }
        encoder.into_inner()
    }

    fn decode(payload: &[u8]) -> Result<Self, TokenError> {
        let mut decoder = Decoder::new(payload);
        let marker = decoder.read_fixed::<3>()?;
        if marker != *TOKEN_MARKER {
            return Err(TokenError::Malformed);
        }
        let kind = decoder.read_u8()?;
        let script = match kind {
            TYPE_ISSUE | TYPE_REISSUE => {
                let name = read_name(&mut decoder)?;
                let amount = decoder.read_i64_le()?;
                let units = decoder.read_u8()?;
                let reissuable = decoder.read_u8()? != 0;
                let ipfs = read_optional_bytes(&mut decoder)?;
                if kind == TYPE_ISSUE {
                    TokenScript::Issue {
                        name,
                        amount,
                        units,
                        reissuable,
                        ipfs,
                    }
                } else {
                    TokenScript::Reissue {
                        name,
                        amount,
                        units,
                        reissuable,
                        ipfs,
                    }
                }
            }
            TYPE_OWNERSHIP => TokenScript::Ownership {
                name: read_name(&mut decoder)?,
            },
            TYPE_TRANSFER => {
                let name = read_name(&mut decoder)?;
                let amount = decoder.read_i64_le()?;
                TokenScript::Transfer { name, amount }
            }
            _ => return Err(TokenError::Malformed),
        };
        decoder.finish()?;
        Ok(script)
    }
}

/// A restriction-side operation carried on a null output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenNullOp {
    QualifyAddress {
        qualifier: String,
        address: [u8; 20],
        add: bool,
    },
    FreezeAddress {
        token: String,
        address: [u8; 20],
        freeze: bool,
    },
    GlobalFreeze {
        token: String,
        freeze: bool,
    },
    Verifier {
        token: String,
        verifier: String,
    },
}

impl TokenNullOp {
    pub fn token_name(&self) -> &str {
        match self {
            TokenNullOp::QualifyAddress { qualifier, .. } => qualifier,
            TokenNullOp::FreezeAddress { token, .. }
            | TokenNullOp::GlobalFreeze { token, .. }
            | TokenNullOp::Verifier { token, .. } => token,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(TOKEN_MARKER);
        match self {
            TokenNullOp::QualifyAddress {
                qualifier,
                address,
                add,
            } => {
                encoder.write_u8(TYPE_QUALIFY_ADDRESS);
                encoder.write_var_bytes(qualifier.as_bytes());
                encoder.write_bytes(address);
                encoder.write_u8(*add as u8);
            }
            TokenNullOp::FreezeAddress {
                token,
                address,
                freeze,
            } => {
                encoder.write_u8(TYPE_FREEZE_ADDRESS);
                encoder.write_var_bytes(token.as_bytes());
                encoder.write_bytes(address);
                encoder.write_u8(*freeze as u8);
            }
            TokenNullOp::GlobalFreeze { token, freeze } => {
                encoder.write_u8(TYPE_GLOBAL_FREEZE);
                encoder.write_var_bytes(token.as_bytes());
                encoder.write_u8(*freeze as u8);
            }
            TokenNullOp::Verifier { token, verifier } => {
                encoder.write_u8(TYPE_VERIFIER);
                encoder.write_var_bytes(token.as_bytes());
                encoder.write_var_bytes(verifier.as_bytes());
            }
        }
        encoder.into_inner()
    }

    fn decode(payload: &[u8]) -> Result<Self, TokenError> {
        let mut decoder = Decoder::new(payload);
        let marker = decoder.read_fixed::<3>()?;
        if marker != *TOKEN_MARKER {
            return Err(TokenError::Malformed);
        }
        let kind = decoder.read_u8()?;
        let op = match kind {
            TYPE_QUALIFY_ADDRESS => TokenNullOp::QualifyAddress {
                qualifier: read_name(&mut decoder)?,
                address: decoder.read_fixed::<20>()?,
                add: decoder.read_u8()? != 0,
            },
            TYPE_FREEZE_ADDRESS => TokenNullOp::FreezeAddress {
                token: read_name(&mut decoder)?,
                address: decoder.read_fixed::<20>()?,
                freeze: decoder.read_u8()? != 0,
            },
            TYPE_GLOBAL_FREEZE => TokenNullOp::GlobalFreeze {
                token: read_name(&mut decoder)?,
                freeze: decoder.read_u8()? != 0,
            },
            TYPE_VERIFIER => TokenNullOp::Verifier {
                token: read_name(&mut decoder)?,
                verifier: String::from_utf8(decoder.read_var_bytes()?)
                    .map_err(|_| TokenError::Malformed)?,
            },
            _ => return Err(TokenError::Malformed),
        };
        decoder.finish()?;
        Ok(op)
    }
}

/// Extract the token payload from a value-carrying output script, if any.
/// Unknown payload types under the marker decode to an error, scripts
/// without the marker to `None`.
pub fn parse_token_script(script: &[u8]) -> Result<Option<TokenScript>, TokenError> {
    let Some(payload) = token_payload(script)? else {
        return Ok(None);
    };
    TokenScript::decode(&payload).map(Some)
}

/// Extract a restriction op from a null output: `OP_TOKEN <payload>` with
/// no base script.
pub fn parse_token_null_op(script: &[u8]) -> Result<Option<TokenNullOp>, TokenError> {
    if script.first() != Some(&OP_TOKEN) {
        return Ok(None);
    }
    let Some(payload) = token_payload(script)? else {
        return Ok(None);
    };
    TokenNullOp::decode(&payload).map(Some)
}

fn token_payload(script: &[u8]) -> Result<Option<Vec<u8>>, TokenError> {
    let Some(marker) = find_token_marker(script) else {
        return Ok(None);
    };
    let after = &script[marker + 1..];
    let (payload, _) = read_push(after).ok_or(TokenError::Malformed)?;
    if payload.len() < 4 || &payload[0..3] != TOKEN_MARKER {
        // A stray 0xc0 byte that is not followed by a marked payload is
        // not a token output.
        return Ok(None);
    }
    Ok(Some(payload.to_vec()))
}

fn read_push(script: &[u8]) -> Option<(&[u8], usize)> {
    let first = *script.first()?;
    match first {
        len @ 0x01..=0x4b => {
            let end = 1 + len as usize;
            Some((script.get(1..end)?, end))
        }
        0x4c => {
            let len = *script.get(1)? as usize;
            let end = 2 + len;
            Some((script.get(2..end)?, end))
        }
        0x4d => {
            let bytes = script.get(1..3)?;
            let len = u16::from_le_bytes(bytes.try_into().ok()?) as usize;
            let end = 3 + len;
            Some((script.get(3..end)?, end))
        }
        _ => None,
    }
}

fn read_name(decoder: &mut Decoder<'_>) -> Result<String, TokenError> {
    let bytes = decoder.read_var_bytes()?;
    if bytes.len() > MAX_TOKEN_NAME_LEN + 2 {
        return Err(TokenError::InvalidName);
    }
    String::from_utf8(bytes).map_err(|_| TokenError::InvalidName)
}

fn write_optional_bytes(encoder: &mut Encoder, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            encoder.write_u8(1);
            encoder.write_var_bytes(bytes);
        }
        None => encoder.write_u8(0),
    }
}

fn read_optional_bytes(decoder: &mut Decoder<'_>) -> Result<Option<Vec<u8>>, TokenError> {
    if decoder.read_u8()? == 0 {
        Ok(None)
    } else {
        Ok(Some(decoder.read_var_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_token_null_op, parse_token_script, token_class, TokenClass, TokenNullOp, TokenScript,
    };
    use plbd_script::opcodes::OP_TOKEN;
    use plbd_script::standard::{pay_to_pubkey_hash, push_data, with_token_data};

    #[test]
    fn name_classes() {
        assert_eq!(token_class("PLBCOIN").expect("root"), TokenClass::Root);
        assert_eq!(token_class("PLB/GOLD").expect("sub"), TokenClass::Sub);
        assert_eq!(token_class("PLB#001").expect("unique"), TokenClass::Unique);
        assert_eq!(token_class("PLB!").expect("owner"), TokenClass::Ownership);
        assert_eq!(token_class("#KYC").expect("qualifier"), TokenClass::Qualifier);
        assert_eq!(
            token_class("$SECURITY").expect("restricted"),
            TokenClass::Restricted
        );
        assert!(token_class("lowercase").is_err());
        assert!(token_class("AB").is_err());
        assert!(token_class("_BAD").is_err());
    }

    #[test]
    fn issue_payload_roundtrip() {
        let issue = TokenScript::Issue {
            name: "PLBCOIN".to_string(),
            amount: 21_000 * 100_000_000,
            units: 2,
            reissuable: true,
            ipfs: Some(vec![0x12, 0x20]),
        };
        let base = pay_to_pubkey_hash(&[9u8; 20]);
        let script = with_token_data(&base, &issue.encode());
        let parsed = parse_token_script(&script).expect("parse").expect("payload");
        assert_eq!(parsed, issue);
    }

    #[test]
    fn null_op_roundtrip() {
        let op = TokenNullOp::FreezeAddress {
            token: "$SECURITY".to_string(),
            address: [7u8; 20],
            freeze: true,
        };
        let mut script = vec![OP_TOKEN];
        push_data(&mut script, &op.encode());
        let parsed = parse_token_null_op(&script)
            .expect("parse")
            .expect("payload");
        assert_eq!(parsed, op);
    }

    #[test]
    fn plain_script_has_no_payload() {
        let base = pay_to_pubkey_hash(&[9u8; 20]);
        assert_eq!(parse_token_script(&base).expect("parse"), None);
    }
}
