//! Connect-stage timing counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    utxo_us: AtomicU64,
    token_us: AtomicU64,
    index_us: AtomicU64,
    script_us: AtomicU64,
    flatfile_us: AtomicU64,
    blocks: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectMetricsSnapshot {
    pub utxo_us: u64,
    pub token_us: u64,
    pub index_us: u64,
    pub script_us: u64,
    pub flatfile_us: u64,
    pub blocks: u64,
}

impl ConnectMetrics {
    pub fn record_utxo(&self, elapsed: Duration) {
        self.utxo_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_token(&self, elapsed: Duration) {
        self.token_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_index(&self, elapsed: Duration) {
        self.index_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_script(&self, elapsed: Duration) {
        self.script_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_flatfile(&self, elapsed: Duration) {
        self.flatfile_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            utxo_us: self.utxo_us.load(Ordering::Relaxed),
            token_us: self.token_us.load(Ordering::Relaxed),
            index_us: self.index_us.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            flatfile_us: self.flatfile_us.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }
}
