//! Job assembly
//!
//! Turns an upstream job notification plus the pool session context into a
//! fully assembled [`MiningJob`]: coinbase, Merkle root, 80-byte header,
//! midstate and both targets. Every field is validated before anything is
//! decoded, so a malformed notification is rejected without side effects.

use crate::crypto::{sha256d, upper_word_is_zero, HeaderHasher, Midstate, HEADER_SIZE};
use crate::target::{bits_to_target, difficulty_of, pool_target, Target};
use crate::types::{BlockHeader, EngineSlot, SubmissionRecord, SubmitFlags};
use crate::utils::{parse_hex_u32, validate_hex_string};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Capacity of the assembled coinbase transaction in bytes
pub const MAX_COINBASE_SIZE: usize = 512;

/// Widest extranonce2 the builder can render
pub const MAX_EXTRANONCE2_SIZE: usize = 8;

/// Hex offset of the height push opcode in coinbase1
const HEIGHT_PUSH_OFFSET: usize = 84;

/// Upstream job description as delivered by the pool protocol client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: String,
    /// Previous block hash in pool (word-swapped) hex form
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    #[serde(default)]
    pub merkle_branch: Vec<String>,
    /// Block version, 8 hex digits
    pub version: String,
    /// Compact network target, 8 hex digits
    pub nbits: String,
    /// Network time, 8 hex digits
    pub ntime: String,
    #[serde(default)]
    pub clean_jobs: bool,
}

/// Per-connection values from the pool session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    extranonce1: String,
    extranonce2_size: usize,
}

impl SessionContext {
    /// Validate extranonce1 and clamp the extranonce2 width to 1..=8 bytes
    pub fn new(extranonce1: impl Into<String>, extranonce2_size: usize) -> Result<Self> {
        let extranonce1 = extranonce1.into();
        if extranonce1.len() % 2 != 0 {
            return Err(Error::job("extranonce1 has an odd number of hex digits"));
        }
        validate_hex_string(&extranonce1, None)?;

        Ok(Self {
            extranonce1,
            extranonce2_size: extranonce2_size.clamp(1, MAX_EXTRANONCE2_SIZE),
        })
    }

    pub fn extranonce1(&self) -> &str {
        &self.extranonce1
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }
}

/// Where extranonce2 values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extranonce2Source {
    /// Fresh random value per job
    Random,
    /// Fixed value, for reproducible jobs
    Fixed(u64),
}

/// Knobs that change how jobs are assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    /// Add up to 255 seconds to the network time
    pub randomize_timestamp: bool,
    /// Start each engine at a random offset inside its own half
    pub randomize_start_nonce: bool,
    pub extranonce2: Extranonce2Source,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            randomize_timestamp: false,
            randomize_start_nonce: false,
            extranonce2: Extranonce2Source::Random,
        }
    }
}

/// Render an extranonce2 value as big-endian upper-case hex of `size` bytes
pub fn encode_extranonce2(value: u64, size: usize) -> String {
    let size = size.clamp(1, MAX_EXTRANONCE2_SIZE);
    let masked = if size == MAX_EXTRANONCE2_SIZE {
        value
    } else {
        value & ((1u64 << (size * 8)) - 1)
    };
    format!("{:0width$X}", masked, width = size * 2)
}

/// Block height from a BIP34 coinbase1, when it starts with a 3-byte push
pub fn parse_block_height(coinbase1: &str) -> Option<u32> {
    let push = coinbase1.get(HEIGHT_PUSH_OFFSET..HEIGHT_PUSH_OFFSET + 2)?;
    if push != "03" {
        return None;
    }
    let digits = coinbase1.get(HEIGHT_PUSH_OFFSET + 2..HEIGHT_PUSH_OFFSET + 8)?;
    let bytes = hex::decode(digits).ok()?;
    Some(u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16)
}

/// Fold a Merkle branch onto the coinbase hash, all in internal byte order
pub fn fold_merkle_branch(coinbase_hash: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    branch.iter().fold(coinbase_hash, |root, entry| {
        buf[..32].copy_from_slice(&root);
        buf[32..].copy_from_slice(entry);
        sha256d(&buf)
    })
}

/// Convert a pool-format previous hash into internal byte order
fn swap_prev_hash(bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (dst, src) in out.chunks_exact_mut(4).zip(bytes.chunks_exact(4)) {
        dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
    }
    out
}

fn decode_hash(field: &str, value: &str) -> Result<[u8; 32]> {
    validate_hex_string(value, Some(64))
        .map_err(|e| Error::job(format!("{}: {}", field, e)))?;
    let mut out = [0u8; 32];
    hex::decode_to_slice(value, &mut out)?;
    Ok(out)
}

/// An assembled, immutable search job
#[derive(Debug, Clone)]
pub struct MiningJob {
    /// Monotonic publish sequence assigned by the coordinator
    pub sequence: u64,
    pub job_id: String,
    pub header: BlockHeader,
    header_bytes: [u8; HEADER_SIZE],
    hasher: HeaderHasher,
    pub network_target: Target,
    /// Pool target at assembly time
    pub pool_target: Target,
    pub pool_difficulty: f64,
    pub extranonce2: String,
    start_nonces: [u32; 2],
    pub block_height: Option<u32>,
    pub clean_jobs: bool,
}

impl MiningJob {
    /// Assemble a job around an already built header
    pub fn from_header(
        sequence: u64,
        job_id: impl Into<String>,
        header: BlockHeader,
        extranonce2: impl Into<String>,
        pool_difficulty: f64,
    ) -> Self {
        let header_bytes = header.serialize();
        let midstate = Midstate::from_header(&header_bytes);
        let network_target = bits_to_target(header.bits);

        Self {
            sequence,
            job_id: job_id.into(),
            header,
            header_bytes,
            hasher: HeaderHasher::new(midstate, &header_bytes),
            network_target,
            pool_target: pool_target(pool_difficulty, &network_target),
            pool_difficulty,
            extranonce2: extranonce2.into(),
            start_nonces: [EngineSlot::A.nonce_base(), EngineSlot::B.nonce_base()],
            block_height: None,
            clean_jobs: false,
        }
    }

    /// Override the per-engine starting nonces; each is clamped into its half
    pub fn with_start_nonces(mut self, a: u32, b: u32) -> Self {
        self.start_nonces = [
            a & (EngineSlot::HALF - 1),
            EngineSlot::HALF | (b & (EngineSlot::HALF - 1)),
        ];
        self
    }

    /// First nonce the engine in `slot` searches
    pub fn start_nonce(&self, slot: EngineSlot) -> u32 {
        self.start_nonces[slot.index()]
    }

    /// Midstate of the header's first block
    pub fn midstate(&self) -> &Midstate {
        self.hasher.midstate()
    }

    /// Precomputed per-nonce hasher
    pub fn hasher(&self) -> &HeaderHasher {
        &self.hasher
    }

    /// Serialized header template (nonce field as assembled)
    pub fn header_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.header_bytes
    }

    /// Serialized header with `nonce` in place
    pub fn header_with_nonce(&self, nonce: u32) -> [u8; HEADER_SIZE] {
        let mut bytes = self.header_bytes;
        bytes[BlockHeader::NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        bytes
    }

    /// Pool target for a new difficulty, guarded against the network target
    pub fn pool_target_for(&self, difficulty: f64) -> Target {
        pool_target(difficulty, &self.network_target)
    }

    /// Check a display-order hash against the pool target and build a submission
    pub fn evaluate(
        &self,
        slot: EngineSlot,
        nonce: u32,
        hash: &[u8; 32],
        pool_target: &Target,
    ) -> Option<SubmissionRecord> {
        if !pool_target.is_met_by(hash) {
            return None;
        }

        let flags = SubmitFlags {
            met_network_target: self.network_target.is_met_by(hash),
            upper_word_zero: upper_word_is_zero(hash),
        };

        Some(SubmissionRecord {
            job_id: self.job_id.clone(),
            timestamp: self.header.timestamp,
            nonce,
            extranonce2: self.extranonce2.clone(),
            flags,
            difficulty: difficulty_of(hash),
            slot,
            hash: hex::encode(hash),
        })
    }
}

/// Builds [`MiningJob`]s from upstream notifications
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    policy: JobPolicy,
}

impl JobBuilder {
    pub fn new(policy: JobPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    fn next_extranonce2(&self, size: usize) -> String {
        let value = match self.policy.extranonce2 {
            Extranonce2Source::Random => rand::random::<u64>(),
            Extranonce2Source::Fixed(value) => value,
        };
        encode_extranonce2(value, size)
    }

    /// Assemble the coinbase transaction bytes
    pub fn build_coinbase(
        &self,
        notification: &JobNotification,
        session: &SessionContext,
        extranonce2: &str,
    ) -> Result<Vec<u8>> {
        let parts = [
            ("coinbase1", notification.coinbase1.as_str()),
            ("extranonce1", session.extranonce1()),
            ("extranonce2", extranonce2),
            ("coinbase2", notification.coinbase2.as_str()),
        ];

        let mut hex_len = 0usize;
        for (name, part) in &parts {
            if part.len() % 2 != 0 {
                return Err(Error::job(format!("{} has an odd number of hex digits", name)));
            }
            hex_len += part.len();
        }
        if hex_len / 2 > MAX_COINBASE_SIZE {
            return Err(Error::job(format!(
                "Coinbase of {} bytes exceeds capacity of {} bytes",
                hex_len / 2,
                MAX_COINBASE_SIZE
            )));
        }

        let mut coinbase = Vec::with_capacity(hex_len / 2);
        for (name, part) in &parts {
            validate_hex_string(part, None)
                .map_err(|e| Error::job(format!("{}: {}", name, e)))?;
            coinbase.extend_from_slice(&hex::decode(part)?);
        }
        Ok(coinbase)
    }

    /// Compute the Merkle root (internal byte order) for a notification
    pub fn merkle_root(
        &self,
        notification: &JobNotification,
        session: &SessionContext,
        extranonce2: &str,
    ) -> Result<[u8; 32]> {
        let coinbase = self.build_coinbase(notification, session, extranonce2)?;
        let branch = notification
            .merkle_branch
            .iter()
            .map(|entry| decode_hash("merkle_branch", entry))
            .collect::<Result<Vec<_>>>()?;
        Ok(fold_merkle_branch(sha256d(&coinbase), &branch))
    }

    /// Assemble a complete job.
    ///
    /// Fails without side effects when any field is malformed or the
    /// coinbase would not fit.
    pub fn build(
        &self,
        notification: &JobNotification,
        session: &SessionContext,
        pool_difficulty: f64,
        sequence: u64,
    ) -> Result<MiningJob> {
        if notification.job_id.is_empty() {
            return Err(Error::job("Empty job id"));
        }

        let version = parse_hex_u32("version", &notification.version)?;
        let bits = parse_hex_u32("nbits", &notification.nbits)?;
        let mut timestamp = parse_hex_u32("ntime", &notification.ntime)?;
        let prev_hash = swap_prev_hash(&decode_hash("prev_hash", &notification.prev_hash)?);

        let extranonce2 = self.next_extranonce2(session.extranonce2_size());
        let merkle_root = self.merkle_root(notification, session, &extranonce2)?;

        if self.policy.randomize_timestamp {
            timestamp = timestamp.wrapping_add(rand::random::<u32>() & 0xff);
        }

        let header = BlockHeader {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce: 0,
        };

        let mut job = MiningJob::from_header(
            sequence,
            notification.job_id.clone(),
            header,
            extranonce2,
            pool_difficulty,
        );
        if self.policy.randomize_start_nonce {
            job = job.with_start_nonces(rand::random::<u32>(), rand::random::<u32>());
        }
        job.block_height = parse_block_height(&notification.coinbase1);
        job.clean_jobs = notification.clean_jobs;

        debug!(
            job_id = %job.job_id,
            sequence,
            extranonce2 = %job.extranonce2,
            network_target = %job.network_target,
            pool_target = %job.pool_target,
            "Assembled job"
        );

        Ok(job)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::sha256_header_full;
    use assert_matches::assert_matches;

    pub(crate) const COINBASE1: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff2003a086010b2f6d696e65722f";
    pub(crate) const COINBASE2: &str = "ffffffff0100f2052a010000001976a914111111111111111111111111111111111111111188ac00000000";

    pub(crate) fn notification() -> JobNotification {
        JobNotification {
            job_id: "4f".to_string(),
            prev_hash: "00112233445566778899aabbccddeeff0102030405060708090a0b0c0d0e0f10"
                .to_string(),
            coinbase1: COINBASE1.to_string(),
            coinbase2: COINBASE2.to_string(),
            merkle_branch: vec![
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
                "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".to_string(),
            ],
            version: "20000000".to_string(),
            nbits: "1d00ffff".to_string(),
            ntime: "6553f100".to_string(),
            clean_jobs: true,
        }
    }

    pub(crate) fn session() -> SessionContext {
        SessionContext::new("f8002c90", 4).unwrap()
    }

    pub(crate) fn fixed_builder() -> JobBuilder {
        JobBuilder::new(JobPolicy {
            extranonce2: Extranonce2Source::Fixed(0x2a),
            ..JobPolicy::default()
        })
    }

    #[test]
    fn test_encode_extranonce2() {
        assert_eq!(encode_extranonce2(0x2a, 4), "0000002A");
        assert_eq!(encode_extranonce2(0xdeadbeef_cafe, 4), "BEEFCAFE");
        assert_eq!(encode_extranonce2(u64::MAX, 8), "FFFFFFFFFFFFFFFF");
        assert_eq!(encode_extranonce2(0x1ff, 1), "FF");
        assert_eq!(encode_extranonce2(1, 12), "0000000000000001");
    }

    #[test]
    fn test_session_clamps_extranonce2_size() {
        assert_eq!(SessionContext::new("00", 0).unwrap().extranonce2_size(), 1);
        assert_eq!(SessionContext::new("00", 16).unwrap().extranonce2_size(), 8);
        assert!(SessionContext::new("0", 4).is_err());
        assert!(SessionContext::new("zz", 4).is_err());
    }

    #[test]
    fn test_block_height_parsing() {
        assert_eq!(parse_block_height(COINBASE1), Some(100_000));
        assert_eq!(parse_block_height("0100"), None);
        let mut other = COINBASE1.to_string();
        other.replace_range(84..86, "04");
        assert_eq!(parse_block_height(&other), None);
    }

    #[test]
    fn test_merkle_root_scenario() {
        let root = fixed_builder()
            .merkle_root(&notification(), &session(), "0000002A")
            .unwrap();
        assert_eq!(
            hex::encode(root),
            "bd2c6a7467089d7eb8f7829712d812df3e3ee05f4b82a08f4788f87346da2542"
        );
    }

    #[test]
    fn test_merkle_root_without_branch_is_coinbase_hash() {
        let mut n = notification();
        n.merkle_branch.clear();
        let root = fixed_builder().merkle_root(&n, &session(), "0000002A").unwrap();
        assert_eq!(
            hex::encode(root),
            "8731088f38d5110a5cac222fcb670230bb5849e0fed1a22a5fbd1324c4680301"
        );
    }

    #[test]
    fn test_genesis_coinbase_hash() {
        let coinbase = hex::decode("01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000").unwrap();
        let root = fold_merkle_branch(sha256d(&coinbase), &[]);
        let mut display = root;
        display.reverse();
        assert_eq!(
            hex::encode(display),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }

    #[test]
    fn test_build_assembles_header() {
        let job = fixed_builder()
            .build(&notification(), &session(), 1.0, 7)
            .unwrap();

        assert_eq!(
            hex::encode(job.header_bytes()),
            "000000203322110077665544bbaa9988ffeeddcc04030201080706050c0b0a09100f0e0dbd2c6a7467089d7eb8f7829712d812df3e3ee05f4b82a08f4788f87346da254200f15365ffff001d00000000"
        );
        assert_eq!(
            hex::encode(sha256_header_full(job.header_bytes())),
            "c16680a5f8bf0129f341c7137c7561ea0d480e663d67b7f9fc5e73b80f64fefd"
        );
        assert_eq!(job.sequence, 7);
        assert_eq!(job.extranonce2, "0000002A");
        assert_eq!(job.block_height, Some(100_000));
        assert_eq!(job.network_target, Target::DIFFICULTY_ONE);
        assert_eq!(job.start_nonce(EngineSlot::A), 0);
        assert_eq!(job.start_nonce(EngineSlot::B), 0x8000_0000);
        assert!(job.clean_jobs);
    }

    #[test]
    fn test_randomized_start_nonces_stay_in_their_half() {
        let builder = JobBuilder::new(JobPolicy {
            randomize_start_nonce: true,
            randomize_timestamp: true,
            extranonce2: Extranonce2Source::Fixed(0x2a),
        });
        for sequence in 0..32 {
            let job = builder.build(&notification(), &session(), 1.0, sequence).unwrap();
            assert!(EngineSlot::A.contains(job.start_nonce(EngineSlot::A)));
            assert!(EngineSlot::B.contains(job.start_nonce(EngineSlot::B)));
            let delta = job.header.timestamp.wrapping_sub(0x6553f100);
            assert!(delta <= 0xff);
        }
    }

    #[test]
    fn test_random_extranonce2_has_session_width() {
        let builder = JobBuilder::default();
        let session = SessionContext::new("f8002c90", 3).unwrap();
        let job = builder.build(&notification(), &session, 1.0, 0).unwrap();
        assert_eq!(job.extranonce2.len(), 6);
        assert!(job.extranonce2.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_oversized_coinbase_rejected() {
        let mut n = notification();
        n.coinbase2 = "00".repeat(MAX_COINBASE_SIZE);
        let err = fixed_builder().build(&n, &session(), 1.0, 0).unwrap_err();
        assert_matches!(err, Error::Job { .. });
    }

    #[test]
    fn test_coinbase_at_capacity_accepted() {
        let mut n = notification();
        let used = (COINBASE1.len() + 8 + 8) / 2;
        n.coinbase2 = "00".repeat(MAX_COINBASE_SIZE - used);
        let coinbase = fixed_builder()
            .build_coinbase(&n, &session(), "0000002A")
            .unwrap();
        assert_eq!(coinbase.len(), MAX_COINBASE_SIZE);
    }

    #[test]
    fn test_malformed_fields_rejected() {
        let builder = fixed_builder();

        let mut n = notification();
        n.prev_hash.truncate(62);
        assert!(builder.build(&n, &session(), 1.0, 0).is_err());

        let mut n = notification();
        n.coinbase1.push('x');
        n.coinbase1.push('y');
        assert!(builder.build(&n, &session(), 1.0, 0).is_err());

        let mut n = notification();
        n.merkle_branch.push("abcd".to_string());
        assert!(builder.build(&n, &session(), 1.0, 0).is_err());

        let mut n = notification();
        n.nbits = "1d00fff".to_string();
        assert!(builder.build(&n, &session(), 1.0, 0).is_err());

        let mut n = notification();
        n.job_id.clear();
        assert!(builder.build(&n, &session(), 1.0, 0).is_err());
    }

    #[test]
    fn test_evaluate_sets_flags() {
        let job = fixed_builder()
            .build(&notification(), &session(), 1.0, 0)
            .unwrap();

        let mut hash = [0u8; 32];
        hash[4] = 0x01;
        let record = job
            .evaluate(EngineSlot::A, 5, &hash, &job.pool_target)
            .unwrap();
        assert!(record.flags.upper_word_zero);
        assert!(record.flags.met_network_target);
        assert_eq!(record.nonce, 5);
        assert_eq!(record.extranonce2, "0000002A");

        let mut weak = [0u8; 32];
        weak[2] = 0x10;
        let easy = job.pool_target_for(1.0 / 65536.0);
        let record = job.evaluate(EngineSlot::B, 9, &weak, &easy).unwrap();
        assert!(!record.flags.upper_word_zero);
        assert!(!record.flags.met_network_target);
        assert_eq!(record.slot, EngineSlot::B);

        assert!(job.evaluate(EngineSlot::A, 1, &weak, &job.pool_target).is_none());
    }

    #[test]
    fn test_notification_deserializes() {
        let json = serde_json::json!({
            "job_id": "1",
            "prev_hash": "00".repeat(32),
            "coinbase1": "01",
            "coinbase2": "02",
            "version": "20000000",
            "nbits": "1d00ffff",
            "ntime": "6553f100"
        });
        let n: JobNotification = serde_json::from_value(json).unwrap();
        assert!(n.merkle_branch.is_empty());
        assert!(!n.clean_jobs);
    }
}
