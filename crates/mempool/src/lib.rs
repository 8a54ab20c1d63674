//! The transaction memory pool.

pub mod disconnect;
pub mod pool;

pub use disconnect::DisconnectPool;
pub use pool::{
    AcceptContext, AcceptOutcome, Mempool, MempoolEntry, MempoolError, MempoolErrorKind,
    PoolCoins, ScriptCacheHook, TokenGate,
};
