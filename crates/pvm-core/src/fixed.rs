//! Saturating signed fixed-point scalar.
//!
//! 18 bits total, 8 integer bits (sign included), 10 fractional bits.
//! Every operation computes the exact result in a wider integer, rounds to
//! the nearest representable value (ties toward +inf) and clamps into
//! range. Nothing wraps.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Total storage width in bits.
pub const TOTAL_BITS: u32 = 18;
/// Integer bits, sign included.
pub const INT_BITS: u32 = 8;
/// Fractional bits.
pub const FRAC_BITS: u32 = TOTAL_BITS - INT_BITS;

const RAW_MAX: i64 = (1 << (TOTAL_BITS - 1)) - 1;
const RAW_MIN: i64 = -(1 << (TOTAL_BITS - 1));
const SCALE: f64 = (1u32 << FRAC_BITS) as f64;
const HALF_LSB: i64 = 1 << (FRAC_BITS - 1);

/// A quantized value in the 18/8 format.
///
/// The wrapped integer is the value scaled by 2^10 and is always inside
/// `[-131072, 131071]`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(1 << FRAC_BITS);
    pub const HALF: Fixed = Fixed(1 << (FRAC_BITS - 1));
    /// Smallest positive step, 2^-10.
    pub const LSB: Fixed = Fixed(1);
    pub const MAX: Fixed = Fixed(RAW_MAX as i32);
    pub const MIN: Fixed = Fixed(RAW_MIN as i32);

    #[inline]
    const fn saturate(wide: i64) -> Self {
        if wide > RAW_MAX {
            Self::MAX
        } else if wide < RAW_MIN {
            Self::MIN
        } else {
            Fixed(wide as i32)
        }
    }

    /// Build from a raw scaled integer, clamping into range.
    #[inline]
    pub const fn from_bits(raw: i32) -> Self {
        Self::saturate(raw as i64)
    }

    /// The raw scaled integer.
    #[inline]
    pub const fn to_bits(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn from_int(v: i32) -> Self {
        Self::saturate((v as i64) << FRAC_BITS)
    }

    /// Quantize a real number: round to nearest, saturate, NaN maps to zero.
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            return Self::ZERO;
        }
        let scaled = (v * SCALE + 0.5).floor();
        if scaled >= RAW_MAX as f64 {
            Self::MAX
        } else if scaled <= RAW_MIN as f64 {
            Self::MIN
        } else {
            Fixed(scaled as i32)
        }
    }

    #[inline]
    pub fn from_f32(v: f32) -> Self {
        Self::from_f64(v as f64)
    }

    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        self.to_f64() as f32
    }

    /// Integer part, truncated toward zero.
    #[inline]
    pub const fn trunc(self) -> i32 {
        self.0 / (1 << FRAC_BITS)
    }

    #[inline]
    pub const fn abs(self) -> Self {
        Self::saturate((self.0 as i64).abs())
    }

    /// True when the value sits on either end of the representable range.
    #[inline]
    pub const fn is_saturated(self) -> bool {
        self.0 as i64 == RAW_MAX || self.0 as i64 == RAW_MIN
    }

    /// `1 / sqrt(self + eps)` evaluated in f64, then quantized.
    ///
    /// A non-positive radicand saturates to `MAX`.
    pub fn recip_sqrt(self, eps: f64) -> Self {
        let radicand = self.to_f64() + eps;
        if radicand <= 0.0 {
            return Self::MAX;
        }
        Self::from_f64(1.0 / radicand.sqrt())
    }

    #[inline]
    const fn mul_round(self, rhs: Self) -> Self {
        let prod = self.0 as i64 * rhs.0 as i64;
        // arithmetic shift floors, so adding half an LSB first rounds ties up
        Self::saturate((prod + HALF_LSB) >> FRAC_BITS)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    #[inline]
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed::saturate(self.0 as i64 + rhs.0 as i64)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    #[inline]
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed::saturate(self.0 as i64 - rhs.0 as i64)
    }
}

impl Mul for Fixed {
    type Output = Fixed;

    #[inline]
    fn mul(self, rhs: Fixed) -> Fixed {
        self.mul_round(rhs)
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    #[inline]
    fn neg(self) -> Fixed {
        Fixed::saturate(-(self.0 as i64))
    }
}

impl AddAssign for Fixed {
    #[inline]
    fn add_assign(&mut self, rhs: Fixed) {
        *self = *self + rhs;
    }
}

impl SubAssign for Fixed {
    #[inline]
    fn sub_assign(&mut self, rhs: Fixed) {
        *self = *self - rhs;
    }
}

impl MulAssign for Fixed {
    #[inline]
    fn mul_assign(&mut self, rhs: Fixed) {
        *self = *self * rhs;
    }
}

/// Saturating running sum; every partial sum is clamped.
impl Sum for Fixed {
    fn sum<I: Iterator<Item = Fixed>>(iter: I) -> Fixed {
        iter.fold(Fixed::ZERO, |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a Fixed> for Fixed {
    fn sum<I: Iterator<Item = &'a Fixed>>(iter: I) -> Fixed {
        iter.copied().sum()
    }
}

impl From<f64> for Fixed {
    fn from(v: f64) -> Self {
        Fixed::from_f64(v)
    }
}

impl From<f32> for Fixed {
    fn from(v: f32) -> Self {
        Fixed::from_f32(v)
    }
}

impl From<Fixed> for f64 {
    fn from(v: Fixed) -> Self {
        v.to_f64()
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed({} [{}])", self.to_f64(), self.0)
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn exact_reference(wide: f64) -> i64 {
        ((wide * SCALE) + 0.5).floor().clamp(RAW_MIN as f64, RAW_MAX as f64) as i64
    }

    #[test]
    fn test_range_constants() {
        assert_eq!(Fixed::MAX.to_bits(), 131071);
        assert_eq!(Fixed::MIN.to_bits(), -131072);
        assert_eq!(Fixed::MIN.to_f64(), -128.0);
        assert!((Fixed::MAX.to_f64() - 127.9990234375).abs() < 1e-12);
        assert_eq!(Fixed::ONE.to_f64(), 1.0);
        assert_eq!(Fixed::LSB.to_f64(), 1.0 / 1024.0);
    }

    #[test]
    fn test_quantize_rounds_to_nearest() {
        // 0.1 * 1024 = 102.4
        assert_eq!(Fixed::from_f64(0.1).to_bits(), 102);
        // 0.33 * 1024 = 337.92
        assert_eq!(Fixed::from_f64(0.33).to_bits(), 338);
        // exact tie rounds toward +inf
        assert_eq!(Fixed::from_f64(0.5 / 1024.0).to_bits(), 1);
        assert_eq!(Fixed::from_f64(-0.5 / 1024.0).to_bits(), 0);
        // epsilons below half an LSB vanish
        assert_eq!(Fixed::from_f64(1e-4), Fixed::ZERO);
        assert_eq!(Fixed::from_f64(f64::NAN), Fixed::ZERO);
        assert_eq!(Fixed::from_f32(0.33).to_f32(), 338.0 / 1024.0);
    }

    #[test]
    fn test_quantize_saturates() {
        assert_eq!(Fixed::from_f64(200.0), Fixed::MAX);
        assert_eq!(Fixed::from_f64(-200.0), Fixed::MIN);
        assert_eq!(Fixed::from_f64(f64::INFINITY), Fixed::MAX);
        assert_eq!(Fixed::from_f64(f64::NEG_INFINITY), Fixed::MIN);
        assert_eq!(Fixed::from_f64(-128.0), Fixed::MIN);
        assert_eq!(Fixed::from_int(128), Fixed::MAX);
        assert_eq!(Fixed::from_int(-129), Fixed::MIN);
        assert_eq!(Fixed::from_bits(1 << 20), Fixed::MAX);
    }

    #[test]
    fn test_add_sub_boundaries() {
        assert_eq!(Fixed::MAX + Fixed::LSB, Fixed::MAX);
        assert_eq!(Fixed::MIN - Fixed::LSB, Fixed::MIN);
        assert_eq!(Fixed::MAX + Fixed::MAX, Fixed::MAX);
        assert_eq!(Fixed::MIN + Fixed::MIN, Fixed::MIN);
        assert_eq!((Fixed::MAX - Fixed::LSB) + Fixed::LSB, Fixed::MAX);
        assert_eq!(Fixed::MAX + Fixed::MIN, Fixed::from_bits(-1));
        // negating the most negative value cannot be represented
        assert_eq!(-Fixed::MIN, Fixed::MAX);
        assert_eq!(Fixed::MIN.abs(), Fixed::MAX);
    }

    #[test]
    fn test_mul_rounding_and_saturation() {
        // LSB * 0.5 is exactly half an LSB: rounds up
        assert_eq!(Fixed::LSB * Fixed::HALF, Fixed::LSB);
        // -LSB * 0.5 is minus half an LSB: rounds toward +inf, i.e. to zero
        assert_eq!(-Fixed::LSB * Fixed::HALF, Fixed::ZERO);
        assert_eq!(Fixed::MAX * Fixed::ONE, Fixed::MAX);
        assert_eq!(Fixed::MIN * Fixed::ONE, Fixed::MIN);
        assert_eq!(Fixed::MAX * Fixed::from_int(2), Fixed::MAX);
        assert_eq!(Fixed::MIN * Fixed::MIN, Fixed::MAX);
        assert_eq!(Fixed::MIN * Fixed::MAX, Fixed::MIN);
        assert_eq!(Fixed::from_int(3) * Fixed::from_int(-4), Fixed::from_int(-12));
    }

    #[test]
    fn test_random_ops_match_exact_reference() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let a = Fixed::from_bits(rng.gen_range(-131072..=131071));
            let b = Fixed::from_bits(rng.gen_range(-131072..=131071));
            let (fa, fb) = (a.to_f64(), b.to_f64());

            assert_eq!((a + b).to_bits() as i64, exact_reference(fa + fb));
            assert_eq!((a - b).to_bits() as i64, exact_reference(fa - fb));
            assert_eq!((a * b).to_bits() as i64, exact_reference(fa * fb));
        }
    }

    #[test]
    fn test_trunc_and_sum() {
        assert_eq!(Fixed::from_f64(2.75).trunc(), 2);
        assert_eq!(Fixed::from_f64(-2.75).trunc(), -2);
        assert_eq!(Fixed::from_f64(16.0).trunc(), 16);

        let vals = [Fixed::from_int(100), Fixed::from_int(100), Fixed::from_int(-50)];
        // 100 + 100 clamps first, then -50 applies to the clamped value
        let total: Fixed = vals.iter().sum();
        assert_eq!(total, Fixed::MAX - Fixed::from_int(50));
    }

    #[test]
    fn test_recip_sqrt() {
        let r = Fixed::from_int(4).recip_sqrt(0.0);
        assert_eq!(r, Fixed::HALF);
        assert_eq!(Fixed::ZERO.recip_sqrt(0.0), Fixed::MAX);
        // 1/sqrt(1e-5) exceeds the range
        assert_eq!(Fixed::ZERO.recip_sqrt(1e-5), Fixed::MAX);
        // 1/sqrt(1e-4) = 100 fits
        assert_eq!(Fixed::ZERO.recip_sqrt(1e-4), Fixed::from_int(100));
    }

    #[test]
    fn test_serde_as_real_number() {
        let v: Fixed = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, Fixed::from_bits(256));
        assert_eq!(serde_json::to_string(&Fixed::HALF).unwrap(), "0.5");
    }
}
