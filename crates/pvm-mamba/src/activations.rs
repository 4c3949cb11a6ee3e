//! Fixed-point approximations of the block's nonlinearities.
//!
//! No transcendental function is evaluated at run time:
//! - exp decay: 18-entry table sampled every 0.5, linearly interpolated
//! - softplus: three linear segments on [-3, 3], identity / zero outside
//! - SiLU: sigmoid as a single ramp on [-4, 4], saturated outside

use pvm_core::Fixed;

/// Decay curve sampled at x = 0, 0.5, 1.0, .., 8.5, quantized from
/// 1.0, 0.6065, 0.3678, 0.2231, 0.1353, 0.0820, 0.0497, 0.0301, 0.0183,
/// 0.0111, 0.0067, 0.0040, 0.0024, 0.0015, 0.0009, 0.0005, 0, 0.
pub const EXP_DECAY_SAMPLES: [Fixed; 18] = [
    Fixed::ONE, Fixed::from_bits(621), Fixed::from_bits(377), Fixed::from_bits(228), //
    Fixed::from_bits(139), Fixed::from_bits(84), Fixed::from_bits(51), Fixed::from_bits(31), //
    Fixed::from_bits(19), Fixed::from_bits(11), Fixed::from_bits(7), Fixed::from_bits(4), //
    Fixed::from_bits(2), Fixed::from_bits(2), Fixed::from_bits(1), Fixed::from_bits(1), //
    Fixed::ZERO, Fixed::ZERO,
];

/// Upper end of the decay table's domain.
pub const EXP_DECAY_LIMIT: Fixed = Fixed::from_int(8);
const EXP_DECAY_STEPS_PER_UNIT: Fixed = Fixed::from_int(2);

const SOFTPLUS_UPPER: Fixed = Fixed::from_int(3);
const SOFTPLUS_LOWER: Fixed = Fixed::from_int(-3);
const SOFTPLUS_KNEE: Fixed = Fixed::ONE;
// slope / intercept pairs, quantized: 0.13/0.43, 0.50/0.69, 0.87/0.32
const SOFTPLUS_LOW: (Fixed, Fixed) = (Fixed::from_bits(133), Fixed::from_bits(440));
const SOFTPLUS_MID: (Fixed, Fixed) = (Fixed::HALF, Fixed::from_bits(707));
const SOFTPLUS_HIGH: (Fixed, Fixed) = (Fixed::from_bits(891), Fixed::from_bits(328));

const SIGMOID_LIMIT: Fixed = Fixed::from_int(4);
const QUARTER: Fixed = Fixed::from_bits(256);

/// Decay term of the recurrence: 1.0 below zero, 0.0 above 8, the
/// interpolated table value in between.
#[inline]
pub fn exp_decay_approx(x: Fixed) -> Fixed {
    if x < Fixed::ZERO {
        return Fixed::ONE;
    }
    if x > EXP_DECAY_LIMIT {
        return Fixed::ZERO;
    }
    let scaled = x * EXP_DECAY_STEPS_PER_UNIT;
    // x in [0, 8] keeps idx in 0..=16, so idx + 1 stays inside the table
    let idx = scaled.trunc() as usize;
    let frac = scaled - Fixed::from_int(idx as i32);
    let y0 = EXP_DECAY_SAMPLES[idx];
    let y1 = EXP_DECAY_SAMPLES[idx + 1];
    y0 + frac * (y1 - y0)
}

/// Piecewise-linear softplus.
#[inline]
pub fn softplus_approx(x: Fixed) -> Fixed {
    if x > SOFTPLUS_UPPER {
        return x;
    }
    if x < SOFTPLUS_LOWER {
        return Fixed::ZERO;
    }
    let (slope, intercept) = if x < -SOFTPLUS_KNEE {
        SOFTPLUS_LOW
    } else if x < SOFTPLUS_KNEE {
        SOFTPLUS_MID
    } else {
        SOFTPLUS_HIGH
    };
    slope * x + intercept
}

/// Ramp sigmoid: `(0.5 * x) * 0.25 + 0.5` on [-4, 4].
#[inline]
pub fn sigmoid_approx(x: Fixed) -> Fixed {
    if x > SIGMOID_LIMIT {
        Fixed::ONE
    } else if x < -SIGMOID_LIMIT {
        Fixed::ZERO
    } else {
        (Fixed::HALF * x) * QUARTER + Fixed::HALF
    }
}

/// SiLU (Swish) with the ramp sigmoid: `x * sigmoid_approx(x)`.
#[inline]
pub fn silu_approx(x: Fixed) -> Fixed {
    x * sigmoid_approx(x)
}
