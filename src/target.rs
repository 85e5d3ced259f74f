//! Target arithmetic
//!
//! Targets are 256-bit unsigned integers stored most-significant byte first,
//! the same order as a display-order block hash. A hash meets a target when
//! it is numerically less than or equal to it.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Compact encoding of the difficulty-1 target
pub const DIFFICULTY_ONE_BITS: u32 = 0x1d00ffff;

/// Difficulty-1 target as a float: 0xffff * 2^208
pub const MAX_TARGET_F64: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

/// Scale applied to a limb remainder before it is carried into the next lower limb
const REMAINDER_SCALE: f64 = 1e18;

/// 256-bit target, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// Largest representable target (every hash meets it)
    pub const MAX: Target = Target([0xff; 32]);

    /// Zero target (only the zero hash meets it)
    pub const ZERO: Target = Target([0u8; 32]);

    /// Bitcoin's difficulty-1 target, `bits_to_target(0x1d00ffff)`
    pub const DIFFICULTY_ONE: Target = Target([
        0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ]);

    /// Create a target from big-endian bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Big-endian bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Split into four 64-bit limbs, most significant first
    pub fn to_limbs(&self) -> [u64; 4] {
        let mut limbs = [0u64; 4];
        for (limb, chunk) in limbs.iter_mut().zip(self.0.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *limb = u64::from_be_bytes(buf);
        }
        limbs
    }

    /// Assemble from four 64-bit limbs, most significant first
    pub fn from_limbs(limbs: [u64; 4]) -> Self {
        let mut bytes = [0u8; 32];
        for (chunk, limb) in bytes.chunks_exact_mut(8).zip(limbs.iter()) {
            chunk.copy_from_slice(&limb.to_be_bytes());
        }
        Self(bytes)
    }

    /// Check whether a display-order hash meets this target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        meets_target(hash, self)
    }

    /// Difficulty this target corresponds to
    pub fn difficulty(&self) -> f64 {
        difficulty_of(&self.0)
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::target("Target must be exactly 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Target {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Target::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Decode a compact ("nBits") value into a target.
///
/// The low 24 bits are the mantissa, the high byte the size in bytes of the
/// full value. Sizes of 3 or less shift the mantissa right instead. Values
/// that do not fit in 256 bits saturate to [`Target::MAX`].
pub fn bits_to_target(compact: u32) -> Target {
    let exponent = (compact >> 24) as usize;
    let mut mantissa = compact & 0x00ff_ffff;

    let mut bytes = [0u8; 32];
    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        bytes[29..32].copy_from_slice(&mantissa.to_be_bytes()[1..4]);
        return Target(bytes);
    }

    let mantissa_bytes = mantissa.to_be_bytes();
    // Index of the mantissa's least significant byte
    let low = 32isize - (exponent as isize - 3) - 1;
    for (offset, byte) in mantissa_bytes[1..4].iter().rev().enumerate() {
        let index = low - offset as isize;
        if index < 0 {
            if *byte != 0 {
                return Target::MAX;
            }
            continue;
        }
        if index < 32 {
            bytes[index as usize] = *byte;
        }
    }
    Target(bytes)
}

/// Compute `max_target / difficulty` over four 64-bit limbs.
///
/// Each limb, most significant first, is divided as a float. The remainder
/// is scaled by 10^18 and added into the next lower limb before that limb is
/// divided. The result is an approximation whose error is confined to the
/// lower limbs; the top limb is the exact integer quotient whenever the
/// dividend fits in a float's mantissa.
pub fn scale_target_by_difficulty(max_target: &Target, difficulty: f64) -> Target {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return *max_target;
    }

    let limbs = max_target.to_limbs();
    let mut out = [0u64; 4];
    let mut carry = 0u64;

    for (i, limb) in limbs.iter().enumerate() {
        let dividend = limb.saturating_add(carry) as f64;
        let quotient = (dividend / difficulty).floor();
        // `as` saturates at u64::MAX for quotients above 2^64
        out[i] = quotient as u64;

        let remainder = (dividend - quotient * difficulty).max(0.0);
        carry = (remainder * REMAINDER_SCALE) as u64;
    }

    Target::from_limbs(out)
}

/// Big-endian comparison, most significant byte first; equality meets the target
pub fn meets_target(hash: &[u8; 32], target: &Target) -> bool {
    for (h, t) in hash.iter().zip(target.0.iter()) {
        if h < t {
            return true;
        }
        if h > t {
            return false;
        }
    }
    true
}

/// Difficulty of a display-order hash: difficulty-1 target divided by the hash value.
///
/// Returns 0.0 when the quotient is not finite (the zero hash).
pub fn difficulty_of(hash: &[u8; 32]) -> f64 {
    let value = hash.iter().fold(0.0f64, |acc, byte| acc * 256.0 + *byte as f64);
    let difficulty = MAX_TARGET_F64 / value;
    if difficulty.is_finite() {
        difficulty
    } else {
        0.0
    }
}

/// Pool target for a share difficulty, never harder than the network target
pub fn pool_target(difficulty: f64, network: &Target) -> Target {
    let scaled = scale_target_by_difficulty(&Target::DIFFICULTY_ONE, difficulty);
    scaled.max(*network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target_hex(t: &Target) -> String {
        t.to_hex()
    }

    #[test]
    fn test_bits_to_target_difficulty_one() {
        let target = bits_to_target(DIFFICULTY_ONE_BITS);
        assert_eq!(target, Target::DIFFICULTY_ONE);
        assert_eq!(
            target_hex(&target),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_bits_to_target_known_vectors() {
        // Block 125552
        assert_eq!(
            target_hex(&bits_to_target(0x1a44b9f2)),
            "00000000000044b9f20000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(&bits_to_target(0x1b0404cb)),
            "00000000000404cb000000000000000000000000000000000000000000000000"
        );
        // Regtest
        assert_eq!(
            target_hex(&bits_to_target(0x207fffff)),
            "7fffff0000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_bits_to_target_small_exponents() {
        let t = bits_to_target(0x03123456);
        assert_eq!(&t.as_bytes()[29..], &[0x12, 0x34, 0x56]);
        let t = bits_to_target(0x02123456);
        assert_eq!(&t.as_bytes()[29..], &[0x00, 0x12, 0x34]);
        let t = bits_to_target(0x01123456);
        assert_eq!(&t.as_bytes()[29..], &[0x00, 0x00, 0x12]);
        assert_eq!(bits_to_target(0x00123456), Target::ZERO);
    }

    #[test]
    fn test_bits_to_target_overflow_saturates() {
        assert_eq!(bits_to_target(0x22123456), Target::MAX);
        // Leading zero bytes of the mantissa may fall off the top
        let t = bits_to_target(0x2100ffff);
        assert_eq!(&t.as_bytes()[..2], &[0xff, 0xff]);
    }

    #[test]
    fn test_scale_by_difficulty_exact_cases() {
        assert_eq!(
            scale_target_by_difficulty(&Target::DIFFICULTY_ONE, 1.0),
            Target::DIFFICULTY_ONE
        );
        assert_eq!(
            target_hex(&scale_target_by_difficulty(&Target::DIFFICULTY_ONE, 2.0)),
            "000000007fff8000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(&scale_target_by_difficulty(&Target::DIFFICULTY_ONE, 0.5)),
            "00000001fffe0000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(&scale_target_by_difficulty(
                &Target::DIFFICULTY_ONE,
                1.0 / 65536.0
            )),
            "0000ffff00000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_scale_by_difficulty_rejects_bad_input() {
        let max = Target::DIFFICULTY_ONE;
        assert_eq!(scale_target_by_difficulty(&max, f64::NAN), max);
        assert_eq!(scale_target_by_difficulty(&max, f64::INFINITY), max);
        assert_eq!(scale_target_by_difficulty(&max, 0.0), max);
        assert_eq!(scale_target_by_difficulty(&max, -4.0), max);
    }

    #[test]
    fn test_scale_by_difficulty_carries_remainder() {
        let t = scale_target_by_difficulty(&Target::DIFFICULTY_ONE, 1000.0);
        let limbs = t.to_limbs();
        assert_eq!(limbs[0], 0xffff0000 / 1000);
        // Remainder 760 scaled by 1e18 saturates the next limb before division
        assert_eq!(limbs[1], (u64::MAX as f64 / 1000.0).floor() as u64);
    }

    #[test]
    fn test_meets_target_boundaries() {
        let target = Target::DIFFICULTY_ONE;
        assert!(meets_target(target.as_bytes(), &target));

        let mut above = *target.as_bytes();
        above[31] = 1;
        assert!(!meets_target(&above, &target));

        let mut below = *target.as_bytes();
        below[5] = 0xfe;
        assert!(meets_target(&below, &target));
        assert!(target.is_met_by(&below));
        assert!(!target.is_met_by(&above));

        assert!(meets_target(&[0xff; 32], &Target::MAX));
        assert!(meets_target(&[0u8; 32], &Target::ZERO));
        assert!(!meets_target(&[0xff; 32], &Target::ZERO));
    }

    #[test]
    fn test_difficulty_of_known_values() {
        assert_eq!(difficulty_of(Target::DIFFICULTY_ONE.as_bytes()), 1.0);
        let half = scale_target_by_difficulty(&Target::DIFFICULTY_ONE, 2.0);
        assert_eq!(difficulty_of(half.as_bytes()), 2.0);
        assert_eq!(Target::DIFFICULTY_ONE.difficulty(), 1.0);
        assert_eq!(half.difficulty(), 2.0);
        assert_eq!(difficulty_of(&[0u8; 32]), 0.0);
        assert!(difficulty_of(&[0xff; 32]) < 1e-9);
    }

    #[test]
    fn test_pool_target_never_below_network() {
        let network = bits_to_target(0x1d00ffff);
        // Difficulty above the network difficulty would invert the relationship
        let target = pool_target(4.0, &network);
        assert_eq!(target, network);

        let easy = pool_target(0.25, &network);
        assert!(easy > network);
    }

    #[test]
    fn test_target_string_roundtrip() {
        let s = "00000000ffff0000000000000000000000000000000000000000000000000000";
        let target: Target = s.parse().unwrap();
        assert_eq!(target, Target::DIFFICULTY_ONE);
        assert_eq!(target.to_string(), s);
        assert!("abcd".parse::<Target>().is_err());

        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, format!("\"{}\"", s));
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }

    proptest! {
        #[test]
        fn prop_meets_target_agrees_with_integer_order(h in any::<[u8; 32]>(), t in any::<[u8; 32]>()) {
            use num_bigint::BigUint;
            let hi = BigUint::from_bytes_be(&h);
            let ti = BigUint::from_bytes_be(&t);
            prop_assert_eq!(meets_target(&h, &Target::from_bytes(t)), hi <= ti);
        }

        #[test]
        fn prop_difficulty_decreases_with_hash_value(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != [0u8; 32] && b != [0u8; 32]);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(difficulty_of(&lo) >= difficulty_of(&hi));
        }

        #[test]
        fn prop_scaled_target_tracks_exact_division(difficulty in 1u64..1_000_000) {
            use num_bigint::BigUint;
            let max = BigUint::from_bytes_be(Target::DIFFICULTY_ONE.as_bytes());
            let exact = &max / BigUint::from(difficulty);
            let approx_target = scale_target_by_difficulty(&Target::DIFFICULTY_ONE, difficulty as f64);
            let approx = BigUint::from_bytes_be(approx_target.as_bytes());

            // Top limb is exact
            prop_assert_eq!(approx_target.to_limbs()[0], 0xffff0000u64 / difficulty);

            // Error stays within one unit of the second limb
            let diff = if approx > exact { &approx - &exact } else { &exact - &approx };
            let bound = BigUint::from(1u8) << 192usize;
            prop_assert!(diff <= bound);
        }
    }
}
