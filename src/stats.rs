//! Thread-safe mining statistics
//!
//! A single [`MiningStats`] instance is shared by the coordinator and both
//! engines. Counters are plain atomics; the best difficulty is stored as the
//! bit pattern of an `f64` and raised with a compare-and-swap loop.

use crate::types::{EngineSlot, SubmissionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Shared statistics sink
#[derive(Debug)]
pub struct MiningStats {
    started_at: DateTime<Utc>,
    start_instant: Instant,
    total_jobs: AtomicU64,
    dropped_jobs: AtomicU64,
    hashes: [AtomicU64; 2],
    pool_submissions: AtomicU64,
    upper_word_zero: AtomicU64,
    block_solutions: AtomicU64,
    best_difficulty: AtomicU64,
    pool_difficulty: AtomicU64,
    block_height: AtomicU32,
    accelerator_recoveries: AtomicU64,
    verification_failures: AtomicU64,
    nonce_exhaustions: AtomicU64,
}

impl Default for MiningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MiningStats {
    /// Create an empty statistics sink
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            start_instant: Instant::now(),
            total_jobs: AtomicU64::new(0),
            dropped_jobs: AtomicU64::new(0),
            hashes: [AtomicU64::new(0), AtomicU64::new(0)],
            pool_submissions: AtomicU64::new(0),
            upper_word_zero: AtomicU64::new(0),
            block_solutions: AtomicU64::new(0),
            best_difficulty: AtomicU64::new(0f64.to_bits()),
            pool_difficulty: AtomicU64::new(1f64.to_bits()),
            block_height: AtomicU32::new(0),
            accelerator_recoveries: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            nonce_exhaustions: AtomicU64::new(0),
        }
    }

    /// A new job was published
    pub fn record_job(&self, block_height: Option<u32>) {
        self.total_jobs.fetch_add(1, Ordering::Relaxed);
        if let Some(height) = block_height {
            self.block_height.store(height, Ordering::Relaxed);
        }
    }

    /// An upstream job was rejected by the builder
    pub fn record_dropped_job(&self) {
        self.dropped_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Add hashes attempted by an engine
    pub fn add_hashes(&self, slot: EngineSlot, count: u64) {
        if count > 0 {
            self.hashes[slot.index()].fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Track a submission and its secondary flags
    pub fn record_submission(&self, record: &SubmissionRecord) {
        self.pool_submissions.fetch_add(1, Ordering::Relaxed);
        if record.flags.upper_word_zero {
            self.upper_word_zero.fetch_add(1, Ordering::Relaxed);
        }
        if record.flags.met_network_target {
            self.block_solutions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Raise the best difficulty if `difficulty` exceeds it.
    ///
    /// Returns true when the stored value changed.
    pub fn observe_difficulty(&self, difficulty: f64) -> bool {
        if !difficulty.is_finite() || difficulty <= 0.0 {
            return false;
        }

        let mut current = self.best_difficulty.load(Ordering::Relaxed);
        loop {
            if f64::from_bits(current) >= difficulty {
                return false;
            }
            match self.best_difficulty.compare_exchange_weak(
                current,
                difficulty.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record the pool difficulty currently in force
    pub fn set_pool_difficulty(&self, difficulty: f64) {
        self.pool_difficulty
            .store(difficulty.to_bits(), Ordering::Relaxed);
    }

    /// The accelerator had to be re-initialised
    pub fn record_accelerator_recovery(&self) {
        self.accelerator_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// A hardware candidate failed software re-verification
    pub fn record_verification_failure(&self) {
        self.verification_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An engine ran out of nonces for a job
    pub fn record_nonce_exhaustion(&self) {
        self.nonce_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Hashes attempted by one engine
    pub fn hashes(&self, slot: EngineSlot) -> u64 {
        self.hashes[slot.index()].load(Ordering::Relaxed)
    }

    /// Hashes attempted by both engines
    pub fn total_hashes(&self) -> u64 {
        EngineSlot::ALL.iter().map(|slot| self.hashes(*slot)).sum()
    }

    /// Best difficulty seen so far
    pub fn best_difficulty(&self) -> f64 {
        f64::from_bits(self.best_difficulty.load(Ordering::Relaxed))
    }

    /// Number of pool submissions
    pub fn pool_submissions(&self) -> u64 {
        self.pool_submissions.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.start_instant.elapsed();
        let total_hashes = self.total_hashes();
        let elapsed_secs = elapsed.as_secs_f64();

        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: elapsed.as_secs(),
            total_jobs: self.total_jobs.load(Ordering::Relaxed),
            dropped_jobs: self.dropped_jobs.load(Ordering::Relaxed),
            hashes_a: self.hashes(EngineSlot::A),
            hashes_b: self.hashes(EngineSlot::B),
            total_hashes,
            hash_rate: if elapsed_secs > 0.0 {
                total_hashes as f64 / elapsed_secs
            } else {
                0.0
            },
            pool_submissions: self.pool_submissions(),
            upper_word_zero: self.upper_word_zero.load(Ordering::Relaxed),
            block_solutions: self.block_solutions.load(Ordering::Relaxed),
            best_difficulty: self.best_difficulty(),
            pool_difficulty: f64::from_bits(self.pool_difficulty.load(Ordering::Relaxed)),
            block_height: self.block_height.load(Ordering::Relaxed),
            accelerator_recoveries: self.accelerator_recoveries.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            nonce_exhaustions: self.nonce_exhaustions.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`MiningStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub total_jobs: u64,
    pub dropped_jobs: u64,
    pub hashes_a: u64,
    pub hashes_b: u64,
    pub total_hashes: u64,
    pub hash_rate: f64,
    pub pool_submissions: u64,
    pub upper_word_zero: u64,
    pub block_solutions: u64,
    pub best_difficulty: f64,
    pub pool_difficulty: f64,
    pub block_height: u32,
    pub accelerator_recoveries: u64,
    pub verification_failures: u64,
    pub nonce_exhaustions: u64,
}
