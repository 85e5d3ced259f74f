//! Core types for the mining engine
//!
//! Block header layout, engine slots and the submission record handed to the
//! upstream collaborator.

use crate::crypto::{sha256_header_full, HEADER_SIZE};
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};

/// Bitcoin block header.
///
/// `prev_hash` and `merkle_root` are kept in internal (hashing) byte order,
/// which is the reverse of how block explorers display them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialized header size in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Offset of the nonce within the serialized header
    pub const NONCE_OFFSET: usize = 76;

    /// Serialize using consensus encoding (integers little-endian)
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.version);
        out[4..36].copy_from_slice(&self.prev_hash);
        out[36..68].copy_from_slice(&self.merkle_root);
        LittleEndian::write_u32(&mut out[68..72], self.timestamp);
        LittleEndian::write_u32(&mut out[72..76], self.bits);
        LittleEndian::write_u32(&mut out[76..80], self.nonce);
        out
    }

    /// Parse a consensus-encoded header
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::job(format!(
                "Block header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let version = cursor.read_u32::<LittleEndian>()?;
        let mut prev_hash = [0u8; 32];
        cursor.read_exact(&mut prev_hash)?;
        let mut merkle_root = [0u8; 32];
        cursor.read_exact(&mut merkle_root)?;
        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let bits = cursor.read_u32::<LittleEndian>()?;
        let nonce = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }

    /// Copy of this header with a different nonce
    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    /// Full double hash in display order
    pub fn hash(&self) -> [u8; 32] {
        sha256_header_full(&self.serialize())
    }
}

/// Which half of the nonce space an engine searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineSlot {
    /// Lower half, `[0, 0x8000_0000)`
    A,
    /// Upper half, `[0x8000_0000, 2^32)`
    B,
}

impl EngineSlot {
    /// Both slots in index order
    pub const ALL: [EngineSlot; 2] = [EngineSlot::A, EngineSlot::B];

    /// Size of each half of the nonce space
    pub const HALF: u32 = 0x8000_0000;

    /// Index into per-engine arrays
    pub fn index(self) -> usize {
        match self {
            EngineSlot::A => 0,
            EngineSlot::B => 1,
        }
    }

    /// First nonce of this slot's half
    pub fn nonce_base(self) -> u32 {
        match self {
            EngineSlot::A => 0,
            EngineSlot::B => Self::HALF,
        }
    }

    /// Last nonce of this slot's half (inclusive)
    pub fn nonce_last(self) -> u32 {
        self.nonce_base() + (Self::HALF - 1)
    }

    /// Whether `nonce` falls inside this slot's half
    pub fn contains(self, nonce: u32) -> bool {
        nonce >= self.nonce_base() && nonce <= self.nonce_last()
    }
}

impl fmt::Display for EngineSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineSlot::A => write!(f, "a"),
            EngineSlot::B => write!(f, "b"),
        }
    }
}

/// Secondary-interest flags attached to a submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitFlags {
    /// Hash also meets the network target (block solution)
    pub met_network_target: bool,
    /// Most significant 32 bits of the hash are zero
    pub upper_word_zero: bool,
}

impl SubmitFlags {
    /// Wire bit for the upper-word-zero flag
    pub const UPPER_WORD_ZERO_BIT: u32 = 0x02;

    /// Wire bit for the block-solution flag
    pub const MET_NETWORK_TARGET_BIT: u32 = 0x04;

    /// Encode as a bit set
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.upper_word_zero {
            bits |= Self::UPPER_WORD_ZERO_BIT;
        }
        if self.met_network_target {
            bits |= Self::MET_NETWORK_TARGET_BIT;
        }
        bits
    }
}

/// A nonce whose hash cleared the pool target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub job_id: String,
    pub timestamp: u32,
    pub nonce: u32,
    pub extranonce2: String,
    pub flags: SubmitFlags,
    pub difficulty: f64,
    /// Engine slot that found the nonce
    pub slot: EngineSlot,
    /// Hash in display order, hex encoded
    pub hash: String,
}

impl SubmissionRecord {
    /// Whether this submission is a full block solution
    pub fn is_block_solution(&self) -> bool {
        self.flags.met_network_target
    }
}
