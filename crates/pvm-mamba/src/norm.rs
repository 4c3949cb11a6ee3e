//! RMS and layer normalization in fixed point.
//!
//! Accumulations (sum, sum of squares) stay in the 18-bit format and
//! saturate. Only the final `1 / sqrt(.. + eps)` is taken in f64 and quantized
//! back, because both epsilons are below one LSB.

use pvm_core::{FeatureRow, Fixed, Lanes, PvmError, Result, TokenVector, LANES};

/// RMSNorm over the active lanes of a token:
/// `y[d] = x[d] * rsqrt(mean(x^2) + eps) * weight[d]`.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    lanes: Lanes,
    /// Learnable scale, shape (D,). Inactive lanes are ignored.
    weight: [Fixed; LANES],
    eps: f64,
}

impl RmsNorm {
    pub const DEFAULT_EPS: f64 = 1e-4;

    /// Unit weights.
    pub fn new(lanes: Lanes) -> Self {
        Self {
            lanes,
            weight: [Fixed::ONE; LANES],
            eps: Self::DEFAULT_EPS,
        }
    }

    /// `weight` must hold exactly D values.
    pub fn with_weight(lanes: Lanes, weight: &[Fixed]) -> Result<Self> {
        if weight.len() != lanes.get() {
            return Err(PvmError::LengthMismatch {
                what: "rms norm weight",
                expected: lanes.get(),
                got: weight.len(),
            });
        }
        let mut norm = Self::new(lanes);
        norm.weight[..weight.len()].copy_from_slice(weight);
        Ok(norm)
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn lanes(&self) -> Lanes {
        self.lanes
    }

    pub fn weight(&self) -> &[Fixed] {
        &self.weight[self.lanes.range()]
    }

    /// Reciprocal RMS of the active lanes.
    pub fn inv_rms(&self, x: &TokenVector) -> Fixed {
        let sum_sq: Fixed = x.active(self.lanes).iter().map(|&v| v * v).sum();
        let mean_sq = sum_sq.to_f64() / self.lanes.get() as f64;
        Fixed::from_f64(1.0 / (mean_sq + self.eps).sqrt())
    }

    pub fn forward(&self, x: &TokenVector) -> TokenVector {
        let inv_rms = self.inv_rms(x);
        TokenVector::from_fn(self.lanes, |d| x.lane(d) * inv_rms * self.weight[d])
    }
}

/// Parameter-free layer normalization: `y = (x - mean) * rsqrt(var + eps)`.
///
/// Used over full-width feature rows by the chunked layer, and optionally over
/// a token's active lanes inside a block.
#[derive(Clone, Copy, Debug)]
pub struct LayerNorm {
    eps: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f64 = 1e-5;

    pub fn new() -> Self {
        Self { eps: Self::DEFAULT_EPS }
    }

    pub fn with_eps(eps: f64) -> Self {
        Self { eps }
    }

    /// Mean and reciprocal standard deviation of `x`.
    ///
    /// Both moments are formed as `sum * (1/n)` with `1/n` quantized.
    pub fn stats(&self, x: &[Fixed]) -> (Fixed, Fixed) {
        if x.is_empty() {
            return (Fixed::ZERO, Fixed::ZERO);
        }
        let inv_n = Fixed::from_f64(1.0 / x.len() as f64);
        let mean = x.iter().sum::<Fixed>() * inv_n;
        let var = x
            .iter()
            .map(|&v| {
                let diff = v - mean;
                diff * diff
            })
            .sum::<Fixed>()
            * inv_n;
        (mean, var.recip_sqrt(self.eps))
    }

    pub fn forward_into(&self, x: &[Fixed], out: &mut [Fixed]) {
        let (mean, inv_std) = self.stats(x);
        for (o, &v) in out.iter_mut().zip(x) {
            *o = (v - mean) * inv_std;
        }
    }

    pub fn forward_row(&self, x: &[Fixed]) -> FeatureRow {
        let (mean, inv_std) = self.stats(x);
        x.iter().map(|&v| (v - mean) * inv_std).collect()
    }

    /// Normalize the active lanes of a token; inactive lanes stay zero.
    pub fn forward_token(&self, x: &TokenVector, lanes: Lanes) -> TokenVector {
        let (mean, inv_std) = self.stats(x.active(lanes));
        TokenVector::from_fn(lanes, |d| (x.lane(d) - mean) * inv_std)
    }
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self::new()
    }
}

/// The block's token normalizer.
#[derive(Clone, Debug)]
pub enum Normalizer {
    Rms(RmsNorm),
    Layer { norm: LayerNorm, lanes: Lanes },
}

impl Normalizer {
    #[inline]
    pub fn forward(&self, x: &TokenVector) -> TokenVector {
        match self {
            Normalizer::Rms(norm) => norm.forward(x),
            Normalizer::Layer { norm, lanes } => norm.forward_token(x, *lanes),
        }
    }

    pub fn lanes(&self) -> Lanes {
        match self {
            Normalizer::Rms(norm) => norm.lanes(),
            Normalizer::Layer { lanes, .. } => *lanes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes(d: usize) -> Lanes {
        Lanes::new(d).unwrap()
    }

    fn token(values: &[f64]) -> TokenVector {
        TokenVector::from_fn(lanes(values.len()), |d| Fixed::from_f64(values[d]))
    }

    #[test]
    fn test_rms_norm_matches_float() {
        let values = [1.0, -2.0, 3.0, 0.5, -0.25, 1.5, -1.0, 2.0];
        let norm = RmsNorm::new(lanes(8));
        let out = norm.forward(&token(&values));

        let ms = values.iter().map(|v| v * v).sum::<f64>() / 8.0;
        let inv = 1.0 / (ms + 1e-4).sqrt();
        for (d, &v) in values.iter().enumerate() {
            let expected = v * inv;
            assert!(
                (out[d].to_f64() - expected).abs() < 0.01,
                "lane {d}: {} vs {expected}",
                out[d]
            );
        }
    }

    #[test]
    fn test_rms_norm_scale_covariant() {
        let values = [0.75, -1.25, 1.5, 0.5, -0.5, 1.0, -1.75, 0.25];
        let norm = RmsNorm::new(lanes(8));
        let base = norm.forward(&token(&values));
        for k in [0.5, 2.0, 4.0] {
            let scaled: Vec<f64> = values.iter().map(|v| v * k).collect();
            let out = norm.forward(&token(&scaled));
            for d in 0..8 {
                assert!(
                    (out[d] - base[d]).abs().to_f64() < 0.02,
                    "k = {k}, lane {d}: {} vs {}",
                    out[d],
                    base[d]
                );
            }
        }
    }

    #[test]
    fn test_rms_norm_zero_and_inactive_lanes() {
        let norm = RmsNorm::new(lanes(4));
        assert!(norm.forward(&TokenVector::zeros()).is_zero());

        // lanes beyond D neither contribute nor survive
        let mut raw = [Fixed::ONE; LANES];
        raw[10] = Fixed::from_int(100);
        let x = TokenVector::from_slice(&raw).unwrap();
        let out = norm.forward(&x);
        assert!(out.as_array()[4..].iter().all(|&v| v == Fixed::ZERO));
        assert!((out[0].to_f64() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_rms_norm_weight() {
        let weight = [Fixed::from_int(2), Fixed::HALF];
        let norm = RmsNorm::with_weight(lanes(2), &weight).unwrap();
        let out = norm.forward(&token(&[1.0, 1.0]));
        assert!((out[0].to_f64() - 2.0).abs() < 0.01);
        assert!((out[1].to_f64() - 0.5).abs() < 0.01);

        assert!(matches!(
            RmsNorm::with_weight(lanes(4), &weight),
            Err(PvmError::LengthMismatch { expected: 4, got: 2, .. })
        ));
    }

    #[test]
    fn test_layer_norm_row() {
        let row: Vec<Fixed> = [1.0, 2.0, 3.0, 4.0].iter().map(|&v| Fixed::from_f64(v)).collect();
        let out = LayerNorm::new().forward_row(&row);
        assert_eq!(out.len(), 4);
        let std = 1.25f64.sqrt();
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            let expected = (v - 2.5) / std;
            assert!((out[i].to_f64() - expected).abs() < 0.01, "{i}: {}", out[i]);
        }
        let mean: f64 = out.iter().map(|v| v.to_f64()).sum::<f64>() / 4.0;
        assert!(mean.abs() < 0.01);
    }

    #[test]
    fn test_layer_norm_constant_row_is_zero() {
        let row = vec![Fixed::from_f64(0.05); 32];
        let out = LayerNorm::new().forward_row(&row);
        assert!(out.iter().all(|&v| v == Fixed::ZERO));

        let (mean, inv_std) = LayerNorm::new().stats(&row);
        assert_eq!(mean, Fixed::from_f64(0.05));
        assert!(inv_std.is_saturated());
    }

    #[test]
    fn test_layer_norm_token_matches_row() {
        let values = [0.5, -1.0, 2.0, 0.0, 1.25, -0.75];
        let row: Vec<Fixed> = values.iter().map(|&v| Fixed::from_f64(v)).collect();
        let norm = LayerNorm::new();
        let by_row = norm.forward_row(&row);
        let by_token = norm.forward_token(&token(&values), lanes(6));
        assert_eq!(&by_row[..], by_token.active(lanes(6)));

        let mut into = vec![Fixed::ZERO; 6];
        norm.forward_into(&row, &mut into);
        assert_eq!(&by_row[..], &into[..]);
    }

    #[test]
    fn test_normalizer_dispatch() {
        let x = token(&[1.0, 3.0]);
        let rms = Normalizer::Rms(RmsNorm::new(lanes(2)));
        let ln = Normalizer::Layer { norm: LayerNorm::new(), lanes: lanes(2) };
        assert_eq!(rms.lanes(), lanes(2));
        // layer norm centres, rms does not
        assert!(rms.forward(&x)[0] > Fixed::ZERO);
        assert!(ln.forward(&x)[0] < Fixed::ZERO);
    }
}
