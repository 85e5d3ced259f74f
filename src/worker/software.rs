//! Software hash engine
//!
//! Resumes the header double hash from the job's midstate for every nonce,
//! entirely in addressable memory.

use super::HashEngine;
use crate::crypto::HeaderHasher;
use crate::job::MiningJob;
use crate::Result;

/// Portable engine built on [`HeaderHasher`]
#[derive(Debug, Default)]
pub struct SoftwareEngine {
    hasher: Option<HeaderHasher>,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashEngine for SoftwareEngine {
    fn engine_type(&self) -> &'static str {
        "software"
    }

    fn load_job(&mut self, job: &MiningJob) -> Result<()> {
        // Private copy so the per-nonce path never touches the shared job
        self.hasher = Some(job.hasher().clone());
        Ok(())
    }

    #[inline]
    fn try_nonce(&mut self, job: &MiningJob, nonce: u32) -> Result<Option<[u8; 32]>> {
        match &self.hasher {
            Some(hasher) => Ok(hasher.hash_nonce(nonce)),
            None => Ok(job.hasher().hash_nonce(nonce)),
        }
    }
}
