//! Token issuance, transfer and restriction state.

pub mod data;
pub mod state;

pub use data::{
    parse_token_null_op, parse_token_script, token_class, TokenClass, TokenError, TokenNullOp,
    TokenScript,
};
pub use state::{IssuanceRecord, TokenCache, TokenUndoOp, TokenView, TokensDb};
