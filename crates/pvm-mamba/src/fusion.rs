//! Gated output fusion: `y = ssm * silu(gate) + residual`.

use pvm_core::{Lanes, TokenVector};

use crate::activations::silu_approx;

#[derive(Clone, Copy, Debug)]
pub struct GatedFusion {
    lanes: Lanes,
}

impl GatedFusion {
    pub fn new(lanes: Lanes) -> Self {
        Self { lanes }
    }

    #[inline]
    pub fn forward(&self, ssm: &TokenVector, gate: &TokenVector, residual: &TokenVector) -> TokenVector {
        TokenVector::from_fn(self.lanes, |d| {
            ssm.lane(d) * silu_approx(gate.lane(d)) + residual.lane(d)
        })
    }
}
