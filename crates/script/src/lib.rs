//! Script interpreter, signature hashing and standard templates.

pub mod interpreter;
pub mod opcodes;
pub mod sighash;
pub mod standard;

pub use interpreter::{
    verify_script, ScriptError, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
    VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG, VERIFY_LOW_S,
    VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_STRICTENC, VERIFY_WITNESS,
};
pub use standard::{classify, is_offline_staking, strip_token_data, ScriptClass};
