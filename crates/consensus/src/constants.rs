//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 4;
/// Version bit set on blocks produced after the offline-staking fork.
pub const OFFLINE_STAKING_VERSION_MASK: i32 = 0x0800_0000;
/// Maximum depth of a reorganization accepted at header admission.
pub const MAX_REORG_DEPTH: i32 = 60;
/// Number of most-recent blocks whose data must never be pruned.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// The maximum allowed serialized size of a block without witness data
/// (network rule).
pub const MAX_BLOCK_BASE_SIZE: usize = 2_000_000;
/// The maximum allowed block weight (network rule).
pub const MAX_BLOCK_WEIGHT: usize = 8_000_000;
/// The maximum allowed number of signature-check operations in a block,
/// in weighted cost units (network rule).
pub const MAX_BLOCK_SIGOPS_COST: u32 = 80_000;
/// Scale factor between base size and weight.
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Coinbase and coinstake outputs can only be spent after this number of
/// new blocks (network rule).
pub const COINBASE_MATURITY: i32 = 100;

/// Blocks with a timestamp further than this in the future are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of block timestamps the past-median filter spans.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// The maximum weight of a standard transaction.
pub const MAX_STANDARD_TX_WEIGHT: usize = 400_000;
/// The maximum signature-check cost of a standard transaction.
pub const MAX_STANDARD_TX_SIGOPS_COST: u32 = MAX_BLOCK_SIGOPS_COST / 5;
/// The maximum number of in-mempool ancestors a transaction may have.
pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
/// The maximum virtual size of in-mempool ancestors, in bytes.
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: usize = 101_000;
/// The maximum number of in-mempool descendants any ancestor may have.
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
/// The maximum virtual size of in-mempool descendants, in bytes.
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: usize = 101_000;
/// Descendant count cap on the set replaced by a single transaction.
pub const MAX_REPLACEMENT_CANDIDATES: usize = 100;
/// Default mempool size cap, in bytes.
pub const DEFAULT_MAX_MEMPOOL_BYTES: usize = 300 * 1_000_000;
/// Default mempool entry expiry, in seconds.
pub const DEFAULT_MEMPOOL_EXPIRY_SECS: u64 = 336 * 60 * 60;
/// Byte bound on transactions parked for re-admission after a reorg.
pub const MAX_DISCONNECT_POOL_BYTES: usize = 20_000_000;
/// Default incremental relay fee, in base units per 1000 vbytes.
pub const INCREMENTAL_RELAY_FEE_PER_KB: i64 = 1_000;
/// Default minimum relay fee, in base units per 1000 vbytes.
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: i64 = 1_000;

/// Use the past-median time instead of the block time as the lock-time
/// endpoint.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Standard locktime verify flags used by non-consensus code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_MEDIAN_TIME_PAST;
/// Lock-time values at or above this threshold are unix timestamps, below
/// it block heights (network rule).
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Number of blocks connected per activation step before the loop yields.
pub const ACTIVATE_CONNECT_BATCH: usize = 32;
