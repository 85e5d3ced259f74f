//! Job coordinator
//!
//! Owns the current job, the mining-enabled signal and the swap protocol.
//! Engines read the job as an immutable `Arc` snapshot; the coordinator only
//! replaces it after clearing the enabled signal and waiting for both engines
//! to report themselves idle.

use crate::config::Config;
use crate::job::{JobBuilder, JobNotification, JobPolicy, MiningJob, SessionContext};
use crate::stats::MiningStats;
use crate::types::EngineSlot;
use crate::worker::{
    AcceleratorEngine, EmulatedShaPeripheral, EngineRunner, HashEngine, RunnerSettings,
    SoftwareEngine, SubmissionSink,
};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    /// No job published, mining disabled
    Idle,
    /// A job is published and engines may run
    Searching,
    /// Mining disabled while engines retire from the previous job
    Swapping,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoordinatorState::Searching,
            2 => CoordinatorState::Swapping,
            _ => CoordinatorState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CoordinatorState::Idle => 0,
            CoordinatorState::Searching => 1,
            CoordinatorState::Swapping => 2,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::Searching => write!(f, "searching"),
            CoordinatorState::Swapping => write!(f, "swapping"),
        }
    }
}

/// Signals shared between the coordinator and the engine threads.
///
/// The enabled flag and the per-engine busy flags use sequentially consistent
/// ordering: an engine sets busy before re-reading enabled, the coordinator
/// clears enabled before reading busy, so at least one side sees the other.
#[derive(Debug)]
pub struct MiningControl {
    enabled: AtomicBool,
    busy: [AtomicBool; 2],
    job: RwLock<Option<Arc<MiningJob>>>,
    pool_difficulty: AtomicU64,
    generation: AtomicU64,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl MiningControl {
    pub fn new(pool_difficulty: f64) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            busy: [AtomicBool::new(false), AtomicBool::new(false)],
            job: RwLock::new(None),
            pool_difficulty: AtomicU64::new(pool_difficulty.to_bits()),
            generation: AtomicU64::new(0),
            state: AtomicU8::new(CoordinatorState::Idle.as_u8()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_busy(&self, slot: EngineSlot) -> bool {
        self.busy[slot.index()].load(Ordering::SeqCst)
    }

    pub fn any_busy(&self) -> bool {
        EngineSlot::ALL.iter().any(|slot| self.is_busy(*slot))
    }

    pub fn set_busy(&self, slot: EngineSlot, busy: bool) {
        self.busy[slot.index()].store(busy, Ordering::SeqCst);
    }

    /// Snapshot of the published job
    pub fn current_job(&self) -> Option<Arc<MiningJob>> {
        self.job.read().clone()
    }

    /// Replace the published job. Only valid while mining is disabled.
    fn install(&self, job: Arc<MiningJob>) -> Result<()> {
        if self.is_enabled() {
            return Err(Error::invalid_state("job replaced while mining is enabled"));
        }
        *self.job.write() = Some(job);
        Ok(())
    }

    pub fn pool_difficulty(&self) -> f64 {
        f64::from_bits(self.pool_difficulty.load(Ordering::Acquire))
    }

    /// Bumped on every pool difficulty change
    pub fn difficulty_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn set_pool_difficulty(&self, difficulty: f64) {
        self.pool_difficulty
            .store(difficulty.to_bits(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn shutdown(&self) {
        self.set_enabled(false);
        self.shutdown.cancel();
        self.set_state(CoordinatorState::Idle);
    }
}

/// Receives upstream events and publishes jobs to the engines
pub struct JobCoordinator {
    control: Arc<MiningControl>,
    stats: Arc<MiningStats>,
    builder: JobBuilder,
    session: RwLock<Option<SessionContext>>,
    swap_lock: Mutex<()>,
    sequence: AtomicU64,
    engines: Mutex<Vec<(EngineSlot, JoinHandle<Result<()>>)>>,
}

impl JobCoordinator {
    pub fn new(policy: JobPolicy, pool_difficulty: f64, stats: Arc<MiningStats>) -> Self {
        stats.set_pool_difficulty(pool_difficulty);
        Self {
            control: Arc::new(MiningControl::new(pool_difficulty)),
            stats,
            builder: JobBuilder::new(policy),
            session: RwLock::new(None),
            swap_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Coordinator configured from the command line / config file
    pub fn from_config(config: &Config, stats: Arc<MiningStats>) -> Result<Self> {
        let coordinator = Self::new(config.job_policy(), config.pool_difficulty, stats);
        coordinator.set_session(config.extranonce1.clone(), config.extranonce2_size)?;
        Ok(coordinator)
    }

    pub fn control(&self) -> &Arc<MiningControl> {
        &self.control
    }

    pub fn stats(&self) -> &Arc<MiningStats> {
        &self.stats
    }

    pub fn state(&self) -> CoordinatorState {
        self.control.state()
    }

    pub fn current_job(&self) -> Option<Arc<MiningJob>> {
        self.control.current_job()
    }

    pub fn pool_difficulty(&self) -> f64 {
        self.control.pool_difficulty()
    }

    /// Cache the per-connection extranonce settings
    pub fn set_session(&self, extranonce1: impl Into<String>, extranonce2_size: usize) -> Result<()> {
        let session = SessionContext::new(extranonce1, extranonce2_size)?;
        info!(
            extranonce1 = session.extranonce1(),
            extranonce2_size = session.extranonce2_size(),
            "Session context updated"
        );
        *self.session.write() = Some(session);
        Ok(())
    }

    /// Build a job from `notification` and publish it.
    ///
    /// A malformed notification is logged and dropped; the previous job stays
    /// current and engines keep searching it.
    pub fn deliver_job(&self, notification: &JobNotification) -> Result<()> {
        if self.control.is_shutdown() {
            return Err(Error::cancelled("deliver_job"));
        }

        let _swap = self.swap_lock.lock();

        let session = self
            .session
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_state("no session context"))?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let job = match self.builder.build(
            notification,
            &session,
            self.control.pool_difficulty(),
            sequence,
        ) {
            Ok(job) => Arc::new(job),
            Err(e) => {
                warn!(
                    job_id = %notification.job_id,
                    error = %e,
                    "Dropping malformed job, keeping the previous one"
                );
                self.stats.record_dropped_job();
                return Err(e);
            }
        };

        self.publish(job)
    }

    /// Publish a job assembled elsewhere, e.g. from a raw header.
    ///
    /// The job's sequence number is replaced with the coordinator's own.
    pub fn publish_job(&self, mut job: MiningJob) -> Result<()> {
        if self.control.is_shutdown() {
            return Err(Error::cancelled("publish_job"));
        }

        let _swap = self.swap_lock.lock();
        job.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.publish(Arc::new(job))
    }

    /// Disable mining, drain both engines, swap in `job`, re-enable
    fn publish(&self, job: Arc<MiningJob>) -> Result<()> {
        let had_job = self.control.current_job().is_some();
        if had_job {
            self.control.set_state(CoordinatorState::Swapping);
        }

        self.control.set_enabled(false);
        let spins = self.drain();
        if self.control.is_shutdown() {
            return Err(Error::cancelled("job swap"));
        }

        self.control.install(Arc::clone(&job))?;
        self.stats.record_job(job.block_height);
        self.control.set_enabled(true);
        self.control.set_state(CoordinatorState::Searching);

        info!(
            job_id = %job.job_id,
            sequence = job.sequence,
            block_height = job.block_height,
            clean_jobs = job.clean_jobs,
            network_difficulty = job.network_target.difficulty(),
            "Job published"
        );
        debug!(spins, replaced = had_job, "Swap complete");
        Ok(())
    }

    /// Busy-wait until neither engine holds a job snapshot
    fn drain(&self) -> u64 {
        let mut spins = 0u64;
        while self.control.any_busy() && !self.control.is_shutdown() {
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        spins
    }

    /// Update the pool difficulty. Non-finite or non-positive values are ignored.
    pub fn set_pool_difficulty(&self, difficulty: f64) -> bool {
        if !difficulty.is_finite() || difficulty <= 0.0 {
            warn!(difficulty, "Ignoring invalid pool difficulty");
            return false;
        }

        self.control.set_pool_difficulty(difficulty);
        self.stats.set_pool_difficulty(difficulty);
        info!(difficulty, "Pool difficulty updated");
        true
    }

    /// Start `engine` on its own blocking thread
    pub fn spawn_engine(
        &self,
        slot: EngineSlot,
        engine: Box<dyn HashEngine>,
        sink: Arc<dyn SubmissionSink>,
        settings: RunnerSettings,
    ) {
        debug!(slot = %slot, engine_type = engine.engine_type(), "Spawning engine");
        let runner = EngineRunner::new(
            slot,
            engine,
            Arc::clone(&self.control),
            Arc::clone(&self.stats),
            sink,
            settings,
        );
        let handle = tokio::task::spawn_blocking(move || runner.run());
        self.engines.lock().push((slot, handle));
    }

    /// Start the engines enabled in `config`
    pub fn spawn_engines(&self, config: &Config, sink: Arc<dyn SubmissionSink>) -> Result<()> {
        let settings = config.runner_settings()?;

        if !config.disable_software {
            self.spawn_engine(
                EngineSlot::A,
                Box::new(SoftwareEngine::new()),
                Arc::clone(&sink),
                settings,
            );
        }
        if !config.disable_accelerator {
            let engine = AcceleratorEngine::new(EmulatedShaPeripheral::new(), Arc::clone(&self.stats));
            self.spawn_engine(EngineSlot::B, Box::new(engine), sink, settings);
        }
        Ok(())
    }

    /// Stop mining and join every engine thread
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down job coordinator");
        self.control.shutdown();

        let handles: Vec<_> = self.engines.lock().drain(..).collect();
        let mut first_error = None;
        for (slot, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::engine(slot.to_string(), format!("engine thread failed: {}", e))),
            };
            if let Err(e) = result {
                error!(slot = %slot, error = %e, "Engine exited with error");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
