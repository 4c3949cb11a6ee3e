//! Streaming causal depthwise convolution, kernel size 3, followed by SiLU.
//!
//! Output for token t only depends on tokens t, t-1 and t-2 of the same lane.
//! The two previous inputs live in a per-lane history that shifts by one for
//! every token processed.

use pvm_core::{Fixed, Lanes, PvmError, Result, TokenVector, LANES};

use crate::activations::silu_approx;

/// Taps per lane: the current token plus two of history.
pub const KERNEL_SIZE: usize = 3;

/// Tap value used when no weights are loaded (0.33 quantized).
pub const DEFAULT_TAP: Fixed = Fixed::from_bits(338);

#[derive(Clone, Debug)]
pub struct CausalConv1d {
    lanes: Lanes,
    /// `weight[k][d]`: tap k of lane d; tap 0 multiplies the current token.
    weight: [[Fixed; LANES]; KERNEL_SIZE],
    /// `history[0]` is token t-1, `history[1]` token t-2.
    history: [[Fixed; LANES]; KERNEL_SIZE - 1],
}

impl CausalConv1d {
    pub fn new(lanes: Lanes) -> Self {
        Self {
            lanes,
            weight: [[DEFAULT_TAP; LANES]; KERNEL_SIZE],
            history: [[Fixed::ZERO; LANES]; KERNEL_SIZE - 1],
        }
    }

    /// Load taps from a tap-major buffer of `KERNEL_SIZE * D` values.
    pub fn with_weights(lanes: Lanes, taps: &[Fixed]) -> Result<Self> {
        let d = lanes.get();
        if taps.len() != KERNEL_SIZE * d {
            return Err(PvmError::LengthMismatch {
                what: "conv weight",
                expected: KERNEL_SIZE * d,
                got: taps.len(),
            });
        }
        let mut conv = Self::new(lanes);
        for (k, row) in taps.chunks_exact(d).enumerate() {
            conv.weight[k][..d].copy_from_slice(row);
        }
        Ok(conv)
    }

    pub fn lanes(&self) -> Lanes {
        self.lanes
    }

    pub fn tap(&self, k: usize, d: usize) -> Fixed {
        self.weight[k][d]
    }

    pub fn history(&self) -> &[[Fixed; LANES]; KERNEL_SIZE - 1] {
        &self.history
    }

    pub fn has_history(&self) -> bool {
        self.history.iter().flatten().any(|&v| v != Fixed::ZERO)
    }

    /// Clear the history so the next token sees zero padding.
    pub fn reset(&mut self) {
        self.history = [[Fixed::ZERO; LANES]; KERNEL_SIZE - 1];
    }

    /// Convolve one token and advance the history.
    pub fn step(&mut self, x: &TokenVector) -> TokenVector {
        let w = &self.weight;
        let [h1, h2] = &mut self.history;
        TokenVector::from_fn(self.lanes, |d| {
            let cur = x.lane(d);
            let acc = cur * w[0][d] + h1[d] * w[1][d] + h2[d] * w[2][d];
            h2[d] = h1[d];
            h1[d] = cur;
            silu_approx(acc)
        })
    }
}

/// Whole-sequence form of [`CausalConv1d::step`], starting from zero history.
pub fn causal_conv1d_fn(conv: &CausalConv1d, seq: &[TokenVector]) -> Vec<TokenVector> {
    (0..seq.len())
        .map(|t| {
            TokenVector::from_fn(conv.lanes(), |d| {
                let mut acc = Fixed::ZERO;
                for k in 0..KERNEL_SIZE.min(t + 1) {
                    acc += seq[t - k].lane(d) * conv.tap(k, d);
                }
                silu_approx(acc)
            })
        })
        .collect()
}
