//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod coin;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{compute_merkle_root, Block, BlockHeader};
pub use coin::Coin;
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
