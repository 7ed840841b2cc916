//! Compact difficulty encoding and chain work arithmetic.
//!
//! Targets and work values are 256-bit quantities; they are kept in [`BigUint`] so that
//! products and sums never wrap.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use thiserror::Error;

/// Sign bit of the compact mantissa
const COMPACT_SIGN_BIT: u32 = 0x0080_0000;
/// Mantissa bits of the compact encoding
const COMPACT_MANTISSA_MASK: u32 = 0x007f_ffff;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactTargetError {
    #[error("compact target {0:#010x} encodes a negative value")]
    Negative(u32),
    #[error("compact target {0:#010x} does not fit in 256 bits")]
    Overflow(u32),
}

/// Decode a compact `bits` field into a 256-bit target.
///
/// The top byte is a base-256 exponent, the low 23 bits the mantissa and bit 23 its sign.
/// Negative and overflowing encodings are rejected the same way Bitcoin Core flags them.
pub fn target_from_bits(bits: u32) -> Result<BigUint, CompactTargetError> {
    let (word, size) = split_compact(bits);

    if word != 0 && bits & COMPACT_SIGN_BIT != 0 {
        return Err(CompactTargetError::Negative(bits));
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(CompactTargetError::Overflow(bits));
    }

    Ok(expand(word, size))
}

/// Encode a target into its compact `bits` form.
///
/// Only the three most significant bytes survive; a mantissa whose top bit would be read
/// as the sign is shifted down one byte.
pub fn bits_from_target(target: &BigUint) -> u32 {
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        let low = target.to_u64().unwrap_or_default();
        (low << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).to_u32().unwrap_or_default()
    };

    if compact & COMPACT_SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Truncate a target to the precision a header can declare.
pub fn round_to_compact(target: &BigUint) -> BigUint {
    let (word, size) = split_compact(bits_from_target(target));
    expand(word, size)
}

/// Compute the expected work for a single block given its target: `2^256 / (target + 1)`.
pub fn work_from_target(target: &BigUint) -> BigUint {
    let max_work = BigUint::one() << 256u32;
    max_work / (target + BigUint::one())
}

/// Mantissa (already shifted for exponents below 3) and exponent of a compact target
fn split_compact(bits: u32) -> (u32, u32) {
    let size = bits >> 24;
    let mut word = bits & COMPACT_MANTISSA_MASK;
    if size <= 3 {
        word >>= 8 * (3 - size);
    }
    (word, size)
}

fn expand(word: u32, size: u32) -> BigUint {
    if word == 0 {
        BigUint::zero()
    } else if size <= 3 {
        BigUint::from(word)
    } else {
        BigUint::from(word) << (8 * (size - 3))
    }
}
