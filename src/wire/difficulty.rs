//! Difficulty from the compact `nBits` field of a block header.
//!
//! `bits` packs a target as `mantissa * 256^(exponent - 3)` with
//! `exponent = bits >> 24` and `mantissa = bits & 0x007fffff`.
//! For exponents of 3 and below the mantissa is shifted right instead,
//! dropping low bytes.
//!
//! Difficulty is the ratio of the genesis target ([`REFERENCE_BITS`]) to the
//! block's target.
use crate::wire::constants::REFERENCE_BITS;

/// A target expressed as `mantissa * 256^shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub mantissa: u32,
    pub shift: u32,
}

impl Target {
    pub fn from_bits(bits: u32) -> Self {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;

        if exponent <= 3 {
            Target {
                mantissa: mantissa >> (8 * (3 - exponent)),
                shift: 0,
            }
        } else {
            Target {
                mantissa,
                shift: exponent - 3,
            }
        }
    }

    pub fn is_zero(self) -> bool {
        self.mantissa == 0
    }
}

/// Difficulty of `bits` relative to the genesis target.
///
/// A zero target yields `f64::INFINITY`.
///
/// ```
/// use btc_wire::wire::difficulty::difficulty_from_bits;
///
/// assert_eq!(difficulty_from_bits(0x1d00ffff), 1.0);
/// ```
pub fn difficulty_from_bits(bits: u32) -> f64 {
    let target = Target::from_bits(bits);
    if target.is_zero() {
        return f64::INFINITY;
    }

    let reference = Target::from_bits(REFERENCE_BITS);
    let byte_delta = reference.shift as i32 - target.shift as i32;

    f64::from(reference.mantissa) / f64::from(target.mantissa) * 256f64.powi(byte_delta)
}
