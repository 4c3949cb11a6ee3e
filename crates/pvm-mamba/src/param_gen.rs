//! Per-token recurrence parameters from the convolved signal.
//!
//! For every active lane: `val = 0.1 * conv`, `delta = softplus(val)`,
//! `B = C = val` and `x = conv`.

use pvm_core::{Fixed, Lanes, RecurrenceParams, TokenVector};

use crate::activations::softplus_approx;

/// Scale applied to the convolved signal before it drives delta, B and C
/// (0.1 quantized).
pub const PARAM_SCALE: Fixed = Fixed::from_bits(102);

#[derive(Clone, Copy, Debug)]
pub struct S6ParamGen {
    lanes: Lanes,
}

impl S6ParamGen {
    pub fn new(lanes: Lanes) -> Self {
        Self { lanes }
    }

    pub fn forward(&self, conv: &TokenVector) -> RecurrenceParams {
        let val = TokenVector::from_fn(self.lanes, |d| PARAM_SCALE * conv.lane(d));
        RecurrenceParams {
            delta: TokenVector::from_fn(self.lanes, |d| softplus_approx(val.lane(d))),
            b: val,
            c: val,
            x: TokenVector::from_fn(self.lanes, |d| conv.lane(d)),
        }
    }
}
