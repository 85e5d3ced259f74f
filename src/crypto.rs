//! SHA-256 primitives for Bitcoin block headers
//!
//! A portable FIPS-180 transform plus the header-specialised double hash used
//! by the search loop. The header path splits the 80-byte header into a
//! once-per-job midstate and a per-nonce tail, and rejects a nonce as soon as
//! the low 16 bits of the final state word are known to be non-zero.

use byteorder::{BigEndian, ByteOrder};

/// Size of a serialized block header in bytes
pub const HEADER_SIZE: usize = 80;

/// SHA-256 block size in bytes
pub const BLOCK_SIZE: usize = 64;

/// Initial hash value H(0)
pub const H_INIT: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
    0x5be0cd19,
];

const K: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4,
    0xab1c5ed5, 0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe,
    0x9bdc06a7, 0xc19bf174, 0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f,
    0x4a7484aa, 0x5cb0a9dc, 0x76f988da, 0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7,
    0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967, 0x27b70a85, 0x2e1b2138, 0x4d2c6dfc,
    0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85, 0xa2bfe8a1, 0xa81a664b,
    0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070, 0x19a4c116,
    0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7,
    0xc67178f2,
];

/// Bit length trailer of an 80-byte message
const HEADER_BIT_LEN: u32 = (HEADER_SIZE as u32) * 8;

/// Bit length trailer of a 32-byte message
const DIGEST_BIT_LEN: u32 = 256;

/// Number of rounds after which the final `e` register equals the last state word
const EARLY_EXIT_ROUND: usize = 61;

#[inline(always)]
fn big_sigma0(x: u32) -> u32 {
    x.rotate_right(2) ^ x.rotate_right(13) ^ x.rotate_right(22)
}

#[inline(always)]
fn big_sigma1(x: u32) -> u32 {
    x.rotate_right(6) ^ x.rotate_right(11) ^ x.rotate_right(25)
}

#[inline(always)]
fn small_sigma0(x: u32) -> u32 {
    x.rotate_right(7) ^ x.rotate_right(18) ^ (x >> 3)
}

#[inline(always)]
fn small_sigma1(x: u32) -> u32 {
    x.rotate_right(17) ^ x.rotate_right(19) ^ (x >> 10)
}

#[inline(always)]
fn ch(x: u32, y: u32, z: u32) -> u32 {
    (x & y) ^ (!x & z)
}

#[inline(always)]
fn maj(x: u32, y: u32, z: u32) -> u32 {
    (x & y) ^ (x & z) ^ (y & z)
}

/// Working registers a..h
type Registers = [u32; 8];

#[inline(always)]
fn round(r: &mut Registers, k: u32, w: u32) {
    let t1 = r[7]
        .wrapping_add(big_sigma1(r[4]))
        .wrapping_add(ch(r[4], r[5], r[6]))
        .wrapping_add(k)
        .wrapping_add(w);
    let t2 = big_sigma0(r[0]).wrapping_add(maj(r[0], r[1], r[2]));
    r[7] = r[6];
    r[6] = r[5];
    r[5] = r[4];
    r[4] = r[3].wrapping_add(t1);
    r[3] = r[2];
    r[2] = r[1];
    r[1] = r[0];
    r[0] = t1.wrapping_add(t2);
}

/// Expand 16 message words into the full 64-word schedule, starting at `from`
#[inline(always)]
fn expand_schedule(w: &mut [u32; 64], from: usize) {
    for t in from.max(16)..64 {
        w[t] = small_sigma1(w[t - 2])
            .wrapping_add(w[t - 7])
            .wrapping_add(small_sigma0(w[t - 15]))
            .wrapping_add(w[t - 16]);
    }
}

/// Run a single SHA-256 compression over 16 message words
pub fn compress_words(state: &mut [u32; 8], words: &[u32; 16]) {
    let mut w = [0u32; 64];
    w[..16].copy_from_slice(words);
    expand_schedule(&mut w, 16);

    let mut r = *state;
    for t in 0..64 {
        round(&mut r, K[t], w[t]);
    }
    for (s, v) in state.iter_mut().zip(r.iter()) {
        *s = s.wrapping_add(*v);
    }
}

/// Run a single SHA-256 compression of `block` into `state`
pub fn compress(state: &mut [u32; 8], block: &[u8; BLOCK_SIZE]) {
    let mut words = [0u32; 16];
    BigEndian::read_u32_into(block, &mut words);
    compress_words(state, &words);
}

fn state_to_bytes(state: &[u32; 8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    BigEndian::write_u32_into(state, &mut out);
    out
}

/// Standard SHA-256 over an arbitrary byte buffer
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut state = H_INIT;
    let mut chunks = data.chunks_exact(BLOCK_SIZE);
    for chunk in &mut chunks {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        compress(&mut state, &block);
    }

    // Padding: 0x80, zeros, then the 64-bit big-endian bit length
    let tail = chunks.remainder();
    let bit_len = (data.len() as u64).wrapping_mul(8);
    let mut pad = [0u8; BLOCK_SIZE * 2];
    pad[..tail.len()].copy_from_slice(tail);
    pad[tail.len()] = 0x80;
    let pad_len = if tail.len() < 56 { BLOCK_SIZE } else { BLOCK_SIZE * 2 };
    BigEndian::write_u64(&mut pad[pad_len - 8..pad_len], bit_len);

    for chunk in pad[..pad_len].chunks_exact(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        compress(&mut state, &block);
    }

    state_to_bytes(&state)
}

/// Double SHA-256, result in internal (hashing) byte order
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Compression state after the first 64 bytes of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midstate(pub [u32; 8]);

impl Midstate {
    /// Compute the midstate for a serialized header
    pub fn from_header(header: &[u8; HEADER_SIZE]) -> Self {
        sha256_midstate(header)
    }

    /// Raw state words
    pub fn words(&self) -> &[u32; 8] {
        &self.0
    }
}

/// Hash only the first 64-byte block of the header, without padding
pub fn sha256_midstate(header: &[u8; HEADER_SIZE]) -> Midstate {
    let mut state = H_INIT;
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&header[..BLOCK_SIZE]);
    compress(&mut state, &block);
    Midstate(state)
}

/// Per-job precomputation for the header double hash.
///
/// The second header block carries the Merkle-root tail, the timestamp, the
/// compact bits and the nonce. Only the nonce word (message word 3) changes
/// during a search, so the first three rounds of that compression are run
/// once here and reused for every nonce.
#[derive(Debug, Clone)]
pub struct HeaderHasher {
    midstate: Midstate,
    tail: [u32; 16],
    prefix: Registers,
}

impl HeaderHasher {
    /// Build a hasher for a header whose first block has already been compressed
    pub fn new(midstate: Midstate, header: &[u8; HEADER_SIZE]) -> Self {
        let mut tail = [0u32; 16];
        BigEndian::read_u32_into(&header[BLOCK_SIZE..HEADER_SIZE], &mut tail[..4]);
        tail[4] = 0x8000_0000;
        tail[15] = HEADER_BIT_LEN;

        let mut prefix = midstate.0;
        for t in 0..3 {
            round(&mut prefix, K[t], tail[t]);
        }

        Self {
            midstate,
            tail,
            prefix,
        }
    }

    /// Midstate this hasher resumes from
    pub fn midstate(&self) -> &Midstate {
        &self.midstate
    }

    /// First SHA-256 of the header with the given nonce, as state words
    #[inline]
    fn first_pass(&self, nonce: u32) -> [u32; 8] {
        let mut w = [0u32; 64];
        w[..16].copy_from_slice(&self.tail);
        // Header stores the nonce little-endian, the schedule reads big-endian
        w[3] = nonce.swap_bytes();
        expand_schedule(&mut w, 16);

        let mut r = self.prefix;
        for t in 3..64 {
            round(&mut r, K[t], w[t]);
        }

        let mut state = self.midstate.0;
        for (s, v) in state.iter_mut().zip(r.iter()) {
            *s = s.wrapping_add(*v);
        }
        state
    }

    /// Double hash for `nonce`.
    ///
    /// Returns `None` when the low 16 bits of the final state word are
    /// non-zero, i.e. the display-order hash does not start with two zero
    /// bytes. Otherwise returns the digest in display order.
    #[inline]
    pub fn hash_nonce(&self, nonce: u32) -> Option<[u8; 32]> {
        let first = self.first_pass(nonce);

        let mut w = [0u32; 64];
        w[..8].copy_from_slice(&first);
        w[8] = 0x8000_0000;
        w[15] = DIGEST_BIT_LEN;
        expand_schedule(&mut w, 16);

        let mut r = H_INIT;
        for t in 0..EARLY_EXIT_ROUND {
            round(&mut r, K[t], w[t]);
        }

        // After round 61 the `e` register shifts unchanged into `h` by round 64
        let upper = H_INIT[7].wrapping_add(r[4]);
        if upper & 0xffff != 0 {
            return None;
        }

        for t in EARLY_EXIT_ROUND..64 {
            round(&mut r, K[t], w[t]);
        }
        let mut state = H_INIT;
        for (s, v) in state.iter_mut().zip(r.iter()) {
            *s = s.wrapping_add(*v);
        }
        Some(display_order(&state))
    }
}

/// Convert final state words into display (reversed) byte order
pub fn display_order(state: &[u32; 8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter().rev()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// Resume from `midstate` and double hash the header, nonce taken from the header.
///
/// Returns the display-order digest, or `None` when the early rejection
/// shortcut proves the hash cannot start with two zero bytes.
pub fn sha256_header(midstate: &Midstate, header: &[u8; HEADER_SIZE]) -> Option<[u8; 32]> {
    let nonce = u32::from_le_bytes([header[76], header[77], header[78], header[79]]);
    HeaderHasher::new(*midstate, header).hash_nonce(nonce)
}

/// Unabridged double hash of a serialized header in display order
pub fn sha256_header_full(header: &[u8; HEADER_SIZE]) -> [u8; 32] {
    let mut digest = sha256d(header);
    digest.reverse();
    digest
}

/// Final state word 7 of a display-order hash
pub fn hash_upper_word(hash: &[u8; 32]) -> u32 {
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// True when the most significant 32 bits of a display-order hash are zero
pub fn upper_word_is_zero(hash: &[u8; 32]) -> bool {
    hash_upper_word(hash) == 0
}
