//! Hash engines
//!
//! Two engines implement the same [`HashEngine`] contract: a portable
//! software engine and one that drives a register-level hash accelerator.
//! [`EngineRunner`] owns the polling loop shared by both: the busy-flag
//! handshake with the coordinator, nonce iteration within the engine's half,
//! periodic yields and submission of qualifying hashes.

use crate::coordinator::MiningControl;
use crate::job::MiningJob;
use crate::stats::MiningStats;
use crate::target::{difficulty_of, Target};
use crate::types::{EngineSlot, SubmissionRecord};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Span};

pub mod accelerator;
pub mod peripheral;
pub mod software;

pub use accelerator::{AcceleratorEngine, AcceleratorOp, HashAccelerator};
pub use peripheral::{EmulatedShaPeripheral, PeripheralHandle};
pub use software::SoftwareEngine;

/// One way of computing the header double hash.
///
/// Engines are driven from a single thread by [`EngineRunner`]; they never
/// see the shared job record, only the snapshot the runner hands them.
pub trait HashEngine: Send {
    /// Get the engine type name for logging
    fn engine_type(&self) -> &'static str;

    /// Prepare per-job state before the first nonce of `job`
    fn load_job(&mut self, job: &MiningJob) -> Result<()>;

    /// Hash one nonce.
    ///
    /// Returns the display-order digest when it starts with two zero bytes,
    /// `None` otherwise.
    fn try_nonce(&mut self, job: &MiningJob, nonce: u32) -> Result<Option<[u8; 32]>>;

    /// Called at every yield point; may re-initialise hardware
    fn check_liveness(&mut self, _job: &MiningJob) -> Result<()> {
        Ok(())
    }
}

/// Receiver of qualifying nonces
pub trait SubmissionSink: Send + Sync {
    fn on_submission(&self, record: SubmissionRecord);
}

impl SubmissionSink for mpsc::UnboundedSender<SubmissionRecord> {
    fn on_submission(&self, record: SubmissionRecord) {
        // Receiver gone means shutdown is in progress
        let _ = self.send(record);
    }
}

/// Strictly increasing nonce iterator over the tail of one engine's half
#[derive(Debug, Clone)]
pub struct NonceCursor {
    next: Option<u32>,
    last: u32,
}

impl NonceCursor {
    /// Iterate from `start` (clamped into `slot`'s half) to the end of the half
    pub fn new(slot: EngineSlot, start: u32) -> Self {
        let start = if slot.contains(start) {
            start
        } else {
            slot.nonce_base()
        };
        Self {
            next: Some(start),
            last: slot.nonce_last(),
        }
    }

    /// Yield `nonce` again on the next call. Used when an engine fault means
    /// the nonce was never actually checked.
    pub fn retry(&mut self, nonce: u32) {
        if nonce <= self.last {
            self.next = Some(nonce);
        }
    }

    /// Nonces left, including the next one
    pub fn remaining(&self) -> u64 {
        match self.next {
            Some(next) => u64::from(self.last - next) + 1,
            None => 0,
        }
    }
}

impl Iterator for NonceCursor {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        let current = self.next?;
        self.next = if current == self.last {
            None
        } else {
            Some(current + 1)
        };
        Some(current)
    }
}

/// Tuning for the engine loop
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    /// Nonces between yield points
    pub yield_interval: u32,
    /// Sleep while mining is disabled or no job is available
    pub idle_poll: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            yield_interval: 256,
            idle_poll: Duration::from_millis(20),
        }
    }
}

/// Why a search pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchEnd {
    /// Mining was disabled
    Stopped,
    /// Every nonce in the half was tried
    Exhausted,
}

/// Per-job search position kept across stop/resume
struct JobProgress {
    sequence: u64,
    cursor: NonceCursor,
    loaded: bool,
    exhausted: bool,
}

/// Polling loop driving one engine
pub struct EngineRunner {
    slot: EngineSlot,
    engine: Box<dyn HashEngine>,
    control: Arc<MiningControl>,
    stats: Arc<MiningStats>,
    sink: Arc<dyn SubmissionSink>,
    settings: RunnerSettings,
}

impl EngineRunner {
    pub fn new(
        slot: EngineSlot,
        engine: Box<dyn HashEngine>,
        control: Arc<MiningControl>,
        stats: Arc<MiningStats>,
        sink: Arc<dyn SubmissionSink>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            slot,
            engine,
            control,
            stats,
            sink,
            settings,
        }
    }

    /// Create a tracing span for this engine
    fn span(&self) -> Span {
        tracing::info_span!(
            "engine",
            engine_type = self.engine.engine_type(),
            slot = %self.slot,
        )
    }

    /// Run until shutdown. Blocks the calling thread.
    pub fn run(mut self) -> Result<()> {
        let span = self.span();
        let _enter = span.enter();
        info!("Engine started");

        let mut progress: Option<JobProgress> = None;

        while !self.control.is_shutdown() {
            if !self.control.is_enabled() {
                std::thread::sleep(self.settings.idle_poll);
                continue;
            }

            // Announce before re-checking so a concurrent swap either sees us
            // busy or we see mining disabled
            self.control.set_busy(self.slot, true);
            if !self.control.is_enabled() {
                self.control.set_busy(self.slot, false);
                continue;
            }

            let job = match self.control.current_job() {
                Some(job) => job,
                None => {
                    self.control.set_busy(self.slot, false);
                    std::thread::sleep(self.settings.idle_poll);
                    continue;
                }
            };

            let outcome = self.prepare(&job, &mut progress).and_then(|state| {
                if state.exhausted {
                    Ok(None)
                } else {
                    self.search(&job, &mut state.cursor).map(Some)
                }
            });

            self.control.set_busy(self.slot, false);

            match outcome {
                Ok(Some(SearchEnd::Stopped)) => {
                    debug!(job_id = %job.job_id, "Search stopped");
                }
                Ok(Some(SearchEnd::Exhausted)) => {
                    if let Some(state) = progress.as_mut() {
                        state.exhausted = true;
                    }
                    self.stats.record_nonce_exhaustion();
                    warn!(job_id = %job.job_id, "Nonce range exhausted, waiting for next job");
                }
                Ok(None) => std::thread::sleep(self.settings.idle_poll),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, category = e.category(), "Recoverable engine error");
                    // Reload the engine but keep the nonce position
                    if let Some(state) = progress.as_mut() {
                        state.loaded = false;
                    }
                    std::thread::sleep(self.settings.idle_poll);
                }
                Err(e) => {
                    error!(error = %e, "Engine failed");
                    return Err(e);
                }
            }
        }

        info!("Engine stopped");
        Ok(())
    }

    /// Load `job` into the engine unless it is already the loaded one
    fn prepare<'a>(
        &mut self,
        job: &MiningJob,
        progress: &'a mut Option<JobProgress>,
    ) -> Result<&'a mut JobProgress> {
        let is_new = progress
            .as_ref()
            .map_or(true, |state| state.sequence != job.sequence);

        if is_new {
            *progress = Some(JobProgress {
                sequence: job.sequence,
                cursor: NonceCursor::new(self.slot, job.start_nonce(self.slot)),
                loaded: false,
                exhausted: false,
            });
        }

        let state = progress
            .as_mut()
            .ok_or_else(|| Error::invalid_state("job progress missing"))?;

        if !state.loaded {
            self.engine.load_job(job)?;
            state.loaded = true;
            debug!(
                job_id = %job.job_id,
                sequence = job.sequence,
                start_nonce = job.start_nonce(self.slot),
                "Loaded job"
            );
        }

        Ok(state)
    }

    /// Iterate nonces while mining stays enabled
    fn search(&mut self, job: &MiningJob, cursor: &mut NonceCursor) -> Result<SearchEnd> {
        let mut generation = self.control.difficulty_generation();
        let mut pool_target = job.pool_target_for(self.control.pool_difficulty());
        let mut since_yield = 0u32;

        let end = loop {
            if !self.control.is_enabled() {
                break SearchEnd::Stopped;
            }

            let nonce = match cursor.next() {
                Some(nonce) => nonce,
                None => break SearchEnd::Exhausted,
            };

            let candidate = match self.engine.try_nonce(job, nonce) {
                Ok(candidate) => candidate,
                Err(e) => {
                    self.stats.add_hashes(self.slot, u64::from(since_yield));
                    if e.is_recoverable() {
                        cursor.retry(nonce);
                    }
                    return Err(e);
                }
            };
            if let Some(hash) = candidate {
                self.handle_candidate(job, nonce, &hash, &pool_target);
            }

            since_yield += 1;
            if since_yield >= self.settings.yield_interval {
                self.stats.add_hashes(self.slot, u64::from(since_yield));
                since_yield = 0;

                let current = self.control.difficulty_generation();
                if current != generation {
                    generation = current;
                    pool_target = job.pool_target_for(self.control.pool_difficulty());
                    debug!(pool_target = %pool_target, "Pool target refreshed");
                }

                self.engine.check_liveness(job)?;
                std::thread::yield_now();
            }
        };

        self.stats.add_hashes(self.slot, u64::from(since_yield));
        Ok(end)
    }

    fn handle_candidate(
        &self,
        job: &MiningJob,
        nonce: u32,
        hash: &[u8; 32],
        pool_target: &Target,
    ) {
        if self.stats.observe_difficulty(difficulty_of(hash)) {
            debug!(hash = %hex::encode(hash), "New best difficulty");
        }

        let Some(record) = job.evaluate(self.slot, nonce, hash, pool_target) else {
            return;
        };

        self.stats.record_submission(&record);
        if record.is_block_solution() {
            info!(
                job_id = %record.job_id,
                nonce = %format!("{:08x}", nonce),
                hash = %record.hash,
                "Block solution found"
            );
        } else {
            debug!(
                job_id = %record.job_id,
                nonce = %format!("{:08x}", nonce),
                difficulty = record.difficulty,
                "Share found"
            );
        }
        self.sink.on_submission(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_cursor_from_base() {
        let mut cursor = NonceCursor::new(EngineSlot::A, 0);
        assert_eq!(cursor.remaining(), 0x8000_0000);
        assert_eq!(cursor.next(), Some(0));
        assert_eq!(cursor.next(), Some(1));
    }

    #[test]
    fn test_nonce_cursor_stops_at_end_of_half() {
        let mut cursor = NonceCursor::new(EngineSlot::A, 0x7fff_fffe);
        assert_eq!(cursor.collect::<Vec<_>>(), vec![0x7fff_fffe, 0x7fff_ffff]);

        cursor = NonceCursor::new(EngineSlot::B, u32::MAX - 1);
        assert_eq!(cursor.next(), Some(u32::MAX - 1));
        assert_eq!(cursor.next(), Some(u32::MAX));
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_nonce_cursor_clamps_foreign_start() {
        let mut cursor = NonceCursor::new(EngineSlot::B, 5);
        assert_eq!(cursor.next(), Some(0x8000_0000));
        let mut cursor = NonceCursor::new(EngineSlot::A, 0x9000_0000);
        assert_eq!(cursor.next(), Some(0));
    }

    #[test]
    fn test_nonce_cursor_retry() {
        let mut cursor = NonceCursor::new(EngineSlot::B, u32::MAX - 2);
        assert_eq!(cursor.next(), Some(u32::MAX - 2));
        cursor.retry(u32::MAX - 2);
        assert_eq!(cursor.remaining(), 3);
        assert_eq!(cursor.next(), Some(u32::MAX - 2));
    }

    /// Fails once on `fail_at`, otherwise never finds anything
    struct FlakyEngine {
        fail_at: Option<u32>,
        tried: Vec<u32>,
    }

    impl HashEngine for FlakyEngine {
        fn engine_type(&self) -> &'static str {
            "flaky"
        }

        fn load_job(&mut self, _job: &MiningJob) -> Result<()> {
            Ok(())
        }

        fn try_nonce(&mut self, _job: &MiningJob, nonce: u32) -> Result<Option<[u8; 32]>> {
            if self.fail_at == Some(nonce) {
                self.fail_at = None;
                return Err(Error::accelerator("busy timeout"));
            }
            self.tried.push(nonce);
            Ok(None)
        }
    }

    #[test]
    fn test_engine_fault_keeps_hash_count_and_retries_nonce() {
        use crate::coordinator::JobCoordinator;
        use crate::job::tests::{fixed_builder, notification};

        let stats = Arc::new(MiningStats::new());
        let coordinator =
            JobCoordinator::new(*fixed_builder().policy(), 1.0, Arc::clone(&stats));
        coordinator.set_session("f8002c90", 4).unwrap();
        coordinator.deliver_job(&notification()).unwrap();
        let job = coordinator.current_job().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(
            EngineSlot::A,
            Box::new(FlakyEngine {
                fail_at: Some(0x7fff_fff4),
                tried: Vec::new(),
            }),
            Arc::clone(coordinator.control()),
            Arc::clone(&stats),
            Arc::new(tx),
            RunnerSettings {
                yield_interval: 1000,
                idle_poll: Duration::from_millis(1),
            },
        );

        let mut cursor = NonceCursor::new(EngineSlot::A, 0x7fff_fff0);
        let err = runner.search(&job, &mut cursor).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(stats.hashes(EngineSlot::A), 4);

        let end = runner.search(&job, &mut cursor).unwrap();
        assert_eq!(end, SearchEnd::Exhausted);
        assert_eq!(stats.hashes(EngineSlot::A), 16);
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let record = SubmissionRecord {
            job_id: "j".to_string(),
            timestamp: 1,
            nonce: 2,
            extranonce2: "00".to_string(),
            flags: Default::default(),
            difficulty: 1.0,
            slot: EngineSlot::B,
            hash: String::new(),
        };
        tx.on_submission(record.clone());
        assert_eq!(rx.try_recv().unwrap(), record);

        drop(rx);
        // Sending after the receiver is gone must not panic
        tx.on_submission(record);
    }
}
