//! Weight containers for blocks and layers, and their flat-buffer layouts.
//!
//! Flat layouts:
//! - projection: `c_out * c_in` weights, row-major by output channel,
//!   followed by `c_out` biases
//! - block: `D` RMS norm weights, then `3 * D` conv taps, tap-major

use rand::Rng;

use pvm_core::{FeatureRow, Fixed, Lanes, PvmError, Result};

use crate::causal_conv1d::{DEFAULT_TAP, KERNEL_SIZE};
use crate::config::PvmConfig;

/// Range of the random test weights, half-open: `[-0.05, 0.05)`.
pub const RANDOM_WEIGHT_RANGE: f64 = 0.05;

/// Dense output projection `y = W x + b` of a layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionWeights {
    c_in: usize,
    c_out: usize,
    /// (c_out, c_in), row-major.
    weight: Vec<Fixed>,
    /// (c_out,)
    bias: Vec<Fixed>,
}

impl ProjectionWeights {
    pub fn zeros(c_in: usize, c_out: usize) -> Self {
        Self {
            c_in,
            c_out,
            weight: vec![Fixed::ZERO; c_out * c_in],
            bias: vec![Fixed::ZERO; c_out],
        }
    }

    /// Split a `c_out * c_in + c_out` buffer into weights and biases.
    pub fn from_flat(c_in: usize, c_out: usize, flat: &[Fixed]) -> Result<Self> {
        let n_weight = c_out * c_in;
        if flat.len() != n_weight + c_out {
            return Err(PvmError::LengthMismatch {
                what: "projection weights",
                expected: n_weight + c_out,
                got: flat.len(),
            });
        }
        let (weight, bias) = flat.split_at(n_weight);
        Ok(Self {
            c_in,
            c_out,
            weight: weight.to_vec(),
            bias: bias.to_vec(),
        })
    }

    /// Quantize float weights `(c_out, c_in)` and biases `(c_out,)`.
    pub fn from_f32(c_in: usize, c_out: usize, weight: &[f32], bias: &[f32]) -> Result<Self> {
        if weight.len() != c_out * c_in {
            return Err(PvmError::LengthMismatch {
                what: "projection weight",
                expected: c_out * c_in,
                got: weight.len(),
            });
        }
        if bias.len() != c_out {
            return Err(PvmError::LengthMismatch {
                what: "projection bias",
                expected: c_out,
                got: bias.len(),
            });
        }
        Ok(Self {
            c_in,
            c_out,
            weight: weight.iter().map(|&w| Fixed::from_f32(w)).collect(),
            bias: bias.iter().map(|&b| Fixed::from_f32(b)).collect(),
        })
    }

    /// Uniform weights and biases in `[-0.05, 0.05)`.
    pub fn random_uniform<R: Rng + ?Sized>(c_in: usize, c_out: usize, rng: &mut R) -> Self {
        let mut draw = || Fixed::from_f64(rng.gen_range(-RANDOM_WEIGHT_RANGE..RANDOM_WEIGHT_RANGE));
        let weight = (0..c_out * c_in).map(|_| draw()).collect();
        let bias = (0..c_out).map(|_| draw()).collect();
        Self { c_in, c_out, weight, bias }
    }

    pub fn c_in(&self) -> usize {
        self.c_in
    }

    pub fn c_out(&self) -> usize {
        self.c_out
    }

    pub fn weight(&self, out_c: usize, in_c: usize) -> Fixed {
        self.weight[out_c * self.c_in + in_c]
    }

    pub fn bias(&self) -> &[Fixed] {
        &self.bias
    }

    /// Weights then biases, the inverse of [`ProjectionWeights::from_flat`].
    pub fn to_flat(&self) -> Vec<Fixed> {
        self.weight.iter().chain(&self.bias).copied().collect()
    }

    /// `out[o] = bias[o] + sum_i x[i] * W[o][i]`, accumulated in order.
    pub fn apply(&self, x: &[Fixed]) -> FeatureRow {
        self.weight
            .chunks_exact(self.c_in)
            .zip(&self.bias)
            .map(|(row, &b)| {
                row.iter().zip(x).fold(b, |acc, (&w, &v)| acc + v * w)
            })
            .collect()
    }
}

/// Per-block learnable parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockWeights {
    /// RMS norm scale, (D,).
    pub norm: Vec<Fixed>,
    /// Conv taps, (3, D) tap-major.
    pub conv: Vec<Fixed>,
}

impl BlockWeights {
    /// Unit norm scale and 0.33 conv taps.
    pub fn defaults(lanes: Lanes) -> Self {
        Self {
            norm: vec![Fixed::ONE; lanes.get()],
            conv: vec![DEFAULT_TAP; KERNEL_SIZE * lanes.get()],
        }
    }

    pub fn from_flat(lanes: Lanes, flat: &[Fixed]) -> Result<Self> {
        let d = lanes.get();
        let expected = d + KERNEL_SIZE * d;
        if flat.len() != expected {
            return Err(PvmError::LengthMismatch {
                what: "block weights",
                expected,
                got: flat.len(),
            });
        }
        let (norm, conv) = flat.split_at(d);
        Ok(Self { norm: norm.to_vec(), conv: conv.to_vec() })
    }

    pub fn random_uniform<R: Rng + ?Sized>(lanes: Lanes, rng: &mut R) -> Self {
        let mut draw = || Fixed::from_f64(rng.gen_range(-RANDOM_WEIGHT_RANGE..RANDOM_WEIGHT_RANGE));
        Self {
            norm: (0..lanes.get()).map(|_| Fixed::ONE + draw()).collect(),
            conv: (0..KERNEL_SIZE * lanes.get()).map(|_| DEFAULT_TAP + draw()).collect(),
        }
    }
}

/// Everything a [`crate::PvmLayer`] needs besides its configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PvmWeights {
    pub projection: ProjectionWeights,
    /// One entry per chunk.
    pub blocks: Vec<BlockWeights>,
}

impl PvmWeights {
    /// Zero projection, default block weights.
    pub fn defaults(config: &PvmConfig) -> Result<Self> {
        let lanes = Lanes::new(config.chunk_dim())?;
        Ok(Self {
            projection: ProjectionWeights::zeros(config.c_in, config.c_out),
            blocks: vec![BlockWeights::defaults(lanes); PvmConfig::N_CHUNKS],
        })
    }

    /// Check every buffer against the layer's dimensions.
    pub fn check(&self, config: &PvmConfig) -> Result<()> {
        let p = &self.projection;
        if p.c_in() != config.c_in {
            return Err(PvmError::LengthMismatch {
                what: "projection input channels",
                expected: config.c_in,
                got: p.c_in(),
            });
        }
        if p.c_out() != config.c_out {
            return Err(PvmError::LengthMismatch {
                what: "projection output channels",
                expected: config.c_out,
                got: p.c_out(),
            });
        }
        if self.blocks.len() != PvmConfig::N_CHUNKS {
            return Err(PvmError::LengthMismatch {
                what: "block weight sets",
                expected: PvmConfig::N_CHUNKS,
                got: self.blocks.len(),
            });
        }
        Ok(())
    }
}
