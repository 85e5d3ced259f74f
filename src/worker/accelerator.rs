//! Accelerator hash engine
//!
//! Drives a memory-mapped SHA-256 block through its text registers. The
//! peripheral cannot be seeded with a midstate, so each nonce costs three
//! compressions: both header blocks, then the 32-byte digest.
//!
//! The block shares its clock with other subsystems and may be switched off
//! underneath us. Liveness is checked at every yield point and again before a
//! candidate is trusted; candidates are re-verified in software.

use super::HashEngine;
use crate::crypto::{display_order, HeaderHasher, BLOCK_SIZE, HEADER_SIZE};
use crate::job::MiningJob;
use crate::stats::MiningStats;
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use tracing::{debug, warn};

/// Commands understood by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorOp {
    /// Reset to the initial hash value and compress the text registers
    Start,
    /// Compress the text registers into the current state
    Continue,
    /// Copy the state into text registers 0..8
    Load,
}

/// Register interface of a SHA-256 peripheral.
///
/// Text registers hold message words in the order the compression function
/// consumes them.
pub trait HashAccelerator: Send {
    /// Power-cycle and reset the peripheral
    fn reinitialize(&mut self);

    /// Whether the peripheral clock is enabled
    fn is_enabled(&self) -> bool;

    fn write_text(&mut self, offset: usize, words: &[u32]);

    fn read_text(&self, index: usize) -> u32;

    fn trigger(&mut self, op: AcceleratorOp);

    fn is_busy(&self) -> bool;
}

/// Padding for the second hash: a 32-byte message in text registers 8..16
const DIGEST_PADDING: [u32; 8] = [0x8000_0000, 0, 0, 0, 0, 0, 0, 256];

/// Default bound on busy polls before the peripheral is declared hung
pub const DEFAULT_MAX_BUSY_POLLS: u32 = 100_000;

/// Engine running the double hash on a [`HashAccelerator`]
pub struct AcceleratorEngine<A> {
    device: A,
    stats: Arc<MiningStats>,
    first_block: [u32; 16],
    second_block: [u32; 16],
    verifier: Option<HeaderHasher>,
    max_busy_polls: u32,
}

impl<A: HashAccelerator> AcceleratorEngine<A> {
    pub fn new(mut device: A, stats: Arc<MiningStats>) -> Self {
        device.reinitialize();
        Self {
            device,
            stats,
            first_block: [0; 16],
            second_block: [0; 16],
            verifier: None,
            max_busy_polls: DEFAULT_MAX_BUSY_POLLS,
        }
    }

    pub fn with_max_busy_polls(mut self, polls: u32) -> Self {
        self.max_busy_polls = polls.max(1);
        self
    }

    pub fn device(&self) -> &A {
        &self.device
    }

    fn recover(&mut self, reason: &str) {
        warn!(reason, "Re-initialising hash accelerator");
        self.device.reinitialize();
        self.stats.record_accelerator_recovery();
    }

    fn wait_idle(&self) -> Result<()> {
        for _ in 0..self.max_busy_polls {
            if !self.device.is_busy() {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(Error::accelerator(format!(
            "peripheral still busy after {} polls",
            self.max_busy_polls
        )))
    }

    fn command(&mut self, op: AcceleratorOp) -> Result<()> {
        self.device.trigger(op);
        self.wait_idle()
    }

    /// Hash the 80-byte header, leaving the first digest in text 0..8
    fn first_hash(&mut self, nonce: u32) -> Result<()> {
        self.device.write_text(0, &self.first_block);
        self.command(AcceleratorOp::Start)?;

        // Header stores the nonce little-endian
        self.second_block[3] = nonce.swap_bytes();
        self.device.write_text(0, &self.second_block);
        self.command(AcceleratorOp::Continue)?;
        self.command(AcceleratorOp::Load)
    }

    /// Hash the first digest in place, leaving the final state in text 0..8
    fn second_hash(&mut self) -> Result<()> {
        self.device.write_text(8, &DIGEST_PADDING);
        self.command(AcceleratorOp::Start)?;
        self.command(AcceleratorOp::Load)
    }

    fn read_digest(&self) -> [u8; 32] {
        let mut state = [0u32; 8];
        for (i, word) in state.iter_mut().enumerate() {
            *word = self.device.read_text(i);
        }
        display_order(&state)
    }
}

impl<A: HashAccelerator> HashEngine for AcceleratorEngine<A> {
    fn engine_type(&self) -> &'static str {
        "accelerator"
    }

    fn load_job(&mut self, job: &MiningJob) -> Result<()> {
        if !self.device.is_enabled() {
            self.recover("disabled before job load");
        }

        let header = job.header_bytes();
        BigEndian::read_u32_into(&header[..BLOCK_SIZE], &mut self.first_block);
        self.second_block = [0; 16];
        BigEndian::read_u32_into(&header[BLOCK_SIZE..HEADER_SIZE], &mut self.second_block[..4]);
        self.second_block[4] = 0x8000_0000;
        self.second_block[15] = (HEADER_SIZE as u32) * 8;

        self.verifier = Some(job.hasher().clone());
        Ok(())
    }

    fn try_nonce(&mut self, job: &MiningJob, nonce: u32) -> Result<Option<[u8; 32]>> {
        if let Err(e) = self.first_hash(nonce).and_then(|_| self.second_hash()) {
            self.recover("command timed out");
            return Err(e);
        }

        if self.device.read_text(7) & 0xffff != 0 {
            return Ok(None);
        }

        // A gated peripheral reads back zeros, which would look like a hit
        if !self.device.is_enabled() {
            self.recover("disabled during hash");
            return Ok(None);
        }

        let hardware = self.read_digest();
        let software = match &self.verifier {
            Some(hasher) => hasher.hash_nonce(nonce),
            None => job.hasher().hash_nonce(nonce),
        };

        match software {
            Some(hash) if hash == hardware => Ok(Some(hash)),
            _ => {
                debug!(
                    nonce = %format!("{:08x}", nonce),
                    hardware = %hex::encode(hardware),
                    "Accelerator candidate failed verification"
                );
                self.stats.record_verification_failure();
                self.recover("candidate failed verification");
                Ok(software)
            }
        }
    }

    fn check_liveness(&mut self, _job: &MiningJob) -> Result<()> {
        if !self.device.is_enabled() {
            self.recover("disabled at yield point");
        }
        Ok(())
    }
}
