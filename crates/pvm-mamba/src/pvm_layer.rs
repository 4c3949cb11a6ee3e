//! Chunked PVM layer: four Vision Mamba blocks over channel chunks.
//!
//! Per token row:
//! 1. layer-normalize the full `c_in` row
//! 2. split it into four chunks of `c_in / 4` channels, one per block
//! 3. run the four blocks concurrently over the whole sequence
//! 4. merge `block_out + skip_scale * original_row`
//! 5. layer-normalize the merged row
//! 6. project to `c_out` channels with `W x + b`
//!
//! The original rows reach the merge stage through a skip stream that must
//! buffer a whole sequence, since every block holds back its residual.

use std::thread;

use smallvec::SmallVec;

use pvm_core::stream::{aligned, first_failure};
use pvm_core::{bounded, FeatureRow, Fixed, Lanes, PvmError, Result, StreamReader, StreamWriter, TokenVector};

use crate::config::PvmConfig;
use crate::norm::LayerNorm;
use crate::vision_mamba::VisionMambaBlock;
use crate::weights::{BlockWeights, ProjectionWeights, PvmWeights};

const N_CHUNKS: usize = PvmConfig::N_CHUNKS;
const CHUNK_IN: [&str; N_CHUNKS] = ["chunk0_in", "chunk1_in", "chunk2_in", "chunk3_in"];
const CHUNK_OUT: [&str; N_CHUNKS] = ["chunk0_out", "chunk1_out", "chunk2_out", "chunk3_out"];
const BLOCK_STAGES: [&str; N_CHUNKS] = ["block0", "block1", "block2", "block3"];

pub struct PvmLayer {
    config: PvmConfig,
    blocks: Vec<VisionMambaBlock>,
    norm: LayerNorm,
    projection: ProjectionWeights,
    skip_scale: Fixed,
}

impl PvmLayer {
    /// Build with the given projection and default block weights.
    pub fn new(config: PvmConfig, projection: ProjectionWeights) -> Result<Self> {
        config.validate()?;
        let lanes = Lanes::new(config.chunk_dim())?;
        let weights = PvmWeights {
            projection,
            blocks: vec![BlockWeights::defaults(lanes); N_CHUNKS],
        };
        Self::with_weights(config, weights)
    }

    /// Build from a flat `c_out * c_in` weights + `c_out` biases buffer.
    pub fn from_flat_weights(config: PvmConfig, flat: &[Fixed]) -> Result<Self> {
        let projection = ProjectionWeights::from_flat(config.c_in, config.c_out, flat)?;
        Self::new(config, projection)
    }

    pub fn with_weights(config: PvmConfig, weights: PvmWeights) -> Result<Self> {
        config.validate()?;
        weights.check(&config)?;
        let block_config = config.block_config()?;
        let blocks = weights
            .blocks
            .iter()
            .map(|w| VisionMambaBlock::with_weights(block_config.clone(), w))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            norm: LayerNorm::with_eps(config.norm_eps),
            skip_scale: Fixed::from_f32(config.skip_scale),
            projection: weights.projection,
            blocks,
            config,
        })
    }

    pub fn config(&self) -> &PvmConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[VisionMambaBlock] {
        &self.blocks
    }

    pub fn projection(&self) -> &ProjectionWeights {
        &self.projection
    }

    pub fn reset(&mut self) {
        self.blocks.iter_mut().for_each(VisionMambaBlock::reset);
    }

    fn check_rows(&self, rows: &[FeatureRow]) -> Result<()> {
        let seq_len = self.config.seq_len();
        if rows.len() != seq_len {
            return Err(PvmError::LengthMismatch {
                what: "layer input rows",
                expected: seq_len,
                got: rows.len(),
            });
        }
        if let Some(row) = rows.iter().find(|r| r.len() != self.config.c_in) {
            return Err(PvmError::LengthMismatch {
                what: "layer input row width",
                expected: self.config.c_in,
                got: row.len(),
            });
        }
        Ok(())
    }

    /// Run one `H * W`-row sequence of `c_in`-wide rows into `c_out`-wide rows.
    pub fn forward_rows(&mut self, rows: &[FeatureRow]) -> Result<Vec<FeatureRow>> {
        self.check_rows(rows)?;
        let seq_len = self.config.seq_len();
        let chunk = self.config.chunk_dim();
        let depths = self.config.block.depths;
        tracing::debug!(seq_len, c_in = self.config.c_in, c_out = self.config.c_out, "layer sequence start");

        let mut in_txs = Vec::with_capacity(N_CHUNKS);
        let mut in_rxs = Vec::with_capacity(N_CHUNKS);
        let mut out_txs = Vec::with_capacity(N_CHUNKS);
        let mut out_rxs = Vec::with_capacity(N_CHUNKS);
        for k in 0..N_CHUNKS {
            let (tx, rx) = bounded::<TokenVector>(CHUNK_IN[k], depths.internal, seq_len);
            in_txs.push(tx);
            in_rxs.push(rx);
            let (tx, rx) = bounded::<TokenVector>(CHUNK_OUT[k], depths.internal, seq_len);
            out_txs.push(tx);
            out_rxs.push(rx);
        }
        let (skip_tx, skip_rx) = bounded::<FeatureRow>("skip", depths.residual, seq_len);

        let mut out_rows = Vec::with_capacity(seq_len);
        let Self { blocks, norm, projection, skip_scale, .. } = &mut *self;
        let (norm, projection, skip_scale) = (&*norm, &*projection, *skip_scale);
        let merge_out = &mut out_rows;

        thread::scope(|s| {
            let split = s.spawn(move || split_stage(rows, norm, chunk, in_txs, skip_tx));
            let runs: Vec<_> = blocks
                .iter_mut()
                .zip(in_rxs)
                .zip(out_txs)
                .map(|((block, rx), tx)| s.spawn(move || block.run(rx, tx)))
                .collect();
            let merge = s.spawn(move || {
                let merger = Merger { norm, projection, skip_scale, chunk };
                merge_stage(&merger, out_rxs, skip_rx, merge_out)
            });

            let mut results = vec![("split", split.join())];
            results.extend(BLOCK_STAGES.into_iter().zip(runs).map(|(name, h)| (name, h.join())));
            results.push(("merge", merge.join()));
            first_failure(results)
        })?;

        tracing::debug!(seq_len, "layer sequence done");
        Ok(out_rows)
    }

    /// Flat `L * c_in` input, flat `L * c_out` output.
    pub fn forward_flat(&mut self, data: &[Fixed]) -> Result<Vec<Fixed>> {
        let c_in = self.config.c_in;
        let expected = self.config.seq_len() * c_in;
        if data.len() != expected {
            return Err(PvmError::LengthMismatch { what: "layer input buffer", expected, got: data.len() });
        }
        let rows: Vec<FeatureRow> = data.chunks_exact(c_in).map(FeatureRow::from_slice).collect();
        Ok(self.forward_rows(&rows)?.into_iter().flatten().collect())
    }

    /// Quantize a flat float buffer, then [`PvmLayer::forward_flat`].
    pub fn forward_f32(&mut self, data: &[f32]) -> Result<Vec<Fixed>> {
        let quantized: Vec<Fixed> = data.iter().map(|&v| Fixed::from_f32(v)).collect();
        self.forward_flat(&quantized)
    }

    /// Single-threaded equivalent of [`PvmLayer::forward_rows`].
    pub fn forward_sequential(&mut self, rows: &[FeatureRow]) -> Result<Vec<FeatureRow>> {
        self.check_rows(rows)?;
        let chunk = self.config.chunk_dim();
        let normed: Vec<FeatureRow> = rows.iter().map(|r| self.norm.forward_row(r)).collect();

        let mut chunk_outs = Vec::with_capacity(N_CHUNKS);
        for (k, block) in self.blocks.iter_mut().enumerate() {
            let tokens = normed
                .iter()
                .map(|r| TokenVector::from_slice(&r[k * chunk..(k + 1) * chunk]))
                .collect::<Result<Vec<_>>>()?;
            chunk_outs.push(block.forward_sequential(&tokens)?);
        }

        let merger = Merger {
            norm: &self.norm,
            projection: &self.projection,
            skip_scale: self.skip_scale,
            chunk,
        };
        Ok(rows
            .iter()
            .enumerate()
            .map(|(t, orig)| {
                let outs: [TokenVector; N_CHUNKS] = std::array::from_fn(|k| chunk_outs[k][t]);
                merger.row(&outs, orig)
            })
            .collect())
    }
}

/// Post-block half of the layer: skip merge, second norm, projection.
struct Merger<'a> {
    norm: &'a LayerNorm,
    projection: &'a ProjectionWeights,
    skip_scale: Fixed,
    chunk: usize,
}

impl Merger<'_> {
    fn row(&self, outs: &[TokenVector; N_CHUNKS], orig: &[Fixed]) -> FeatureRow {
        let merged: FeatureRow = orig
            .iter()
            .enumerate()
            .map(|(c, &x)| outs[c / self.chunk].lane(c % self.chunk) + self.skip_scale * x)
            .collect();
        self.projection.apply(&self.norm.forward_row(&merged))
    }
}

fn split_stage(
    rows: &[FeatureRow],
    norm: &LayerNorm,
    chunk: usize,
    mut chunks: Vec<StreamWriter<TokenVector>>,
    mut skip: StreamWriter<FeatureRow>,
) -> Result<()> {
    for (pos, row) in rows.iter().enumerate() {
        let normed = norm.forward_row(row);
        for (k, tx) in chunks.iter_mut().enumerate() {
            tx.write(pos, TokenVector::from_slice(&normed[k * chunk..(k + 1) * chunk])?)?;
        }
        skip.write(pos, row.clone())?;
    }
    tracing::trace!(stage = "layer_split", tokens = rows.len(), "stage done");
    Ok(())
}

fn merge_stage(
    merger: &Merger<'_>,
    mut chunks: Vec<StreamReader<TokenVector>>,
    mut skip: StreamReader<FeatureRow>,
    out: &mut Vec<FeatureRow>,
) -> Result<()> {
    for _ in 0..skip.len() {
        let mut positions: SmallVec<[usize; N_CHUNKS + 1]> = SmallVec::new();
        let mut outs = [TokenVector::zeros(); N_CHUNKS];
        for (rx, slot) in chunks.iter_mut().zip(outs.iter_mut()) {
            let (pos, token) = rx.read()?;
            positions.push(pos);
            *slot = token;
        }
        let (pos, orig) = skip.read()?;
        positions.push(pos);
        let pos = aligned("layer_merge", &positions)?;

        let row = merger.row(&outs, &orig);
        if row.iter().any(|v| v.is_saturated()) {
            tracing::warn!(pos, "projected row saturated");
        }
        out.push(row);
    }
    tracing::trace!(stage = "layer_merge", tokens = skip.len(), "stage done");
    for rx in chunks {
        rx.finish()?;
    }
    skip.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelDepths, NormKind};
    use rand::Rng;

    fn random_rows(n: usize, width: usize, scale: f64) -> Vec<FeatureRow> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| (0..width).map(|_| Fixed::from_f64(rng.gen_range(-scale..scale))).collect())
            .collect()
    }

    fn random_layer(config: PvmConfig) -> PvmLayer {
        let mut rng = rand::thread_rng();
        let lanes = Lanes::new(config.chunk_dim()).unwrap();
        let weights = PvmWeights {
            projection: ProjectionWeights::random_uniform(config.c_in, config.c_out, &mut rng),
            blocks: (0..N_CHUNKS).map(|_| BlockWeights::random_uniform(lanes, &mut rng)).collect(),
        };
        PvmLayer::with_weights(config, weights).unwrap()
    }

    #[test]
    fn test_enc5_constant_input() {
        let config = PvmConfig::enc5();
        let mut layer = PvmLayer::new(config.clone(), ProjectionWeights::zeros(32, 64)).unwrap();
        let rows = vec![FeatureRow::from_elem(Fixed::from_f64(0.05), 32); 16];
        let out = layer.forward_rows(&rows).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|r| r.len() == 64));
        assert!(out.iter().flatten().all(|v| !v.is_saturated()));

        // a constant row normalizes to zero, so only the bias survives
        let mut rng = rand::thread_rng();
        let projection = ProjectionWeights::random_uniform(32, 64, &mut rng);
        let mut layer = PvmLayer::new(config, projection.clone()).unwrap();
        let out = layer.forward_rows(&rows).unwrap();
        for row in &out {
            assert_eq!(&row[..], projection.bias());
        }
    }

    #[test]
    fn test_random_input_no_saturation() {
        let mut layer = random_layer(PvmConfig::enc5());
        let rows = random_rows(16, 32, 1.0);
        let out = layer.forward_rows(&rows).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().flatten().all(|v| !v.is_saturated()));
        assert!(out.iter().flatten().any(|&v| v != Fixed::ZERO));
    }

    #[test]
    fn test_pipeline_matches_sequential() {
        for norm in [NormKind::Rms, NormKind::Layer] {
            let mut config = PvmConfig::enc5();
            config.block.norm = norm;
            config.skip_scale = 0.5;
            let mut layer = random_layer(config);
            let rows = random_rows(16, 32, 2.0);
            let piped = layer.forward_rows(&rows).unwrap();
            let serial = layer.forward_sequential(&rows).unwrap();
            assert_eq!(piped, serial, "{norm:?}");
        }
    }

    #[test]
    fn test_long_sequence_with_single_slot_streams() {
        let l = 16 * 16;
        let mut config = PvmConfig { height: 16, width: 16, c_in: 128, c_out: 32, ..PvmConfig::enc5() };
        config.block.depths = ChannelDepths { residual: l, gate: l, internal: 1 };
        let mut layer = random_layer(config);
        assert_eq!(layer.config().seq_len(), l);
        assert_eq!(layer.blocks().len(), N_CHUNKS);
        assert!(layer.blocks().iter().all(|b| b.lanes() == Lanes::FULL));

        let rows = random_rows(l, 128, 1.0);
        let piped = layer.forward_rows(&rows).unwrap();
        let serial = layer.forward_sequential(&rows).unwrap();
        assert_eq!(piped.len(), l);
        assert_eq!(piped, serial);
    }

    #[test]
    fn test_dec2_single_token() {
        let mut layer = random_layer(PvmConfig::dec2());
        let rows = random_rows(1, 64, 1.0);
        let out = layer.forward_rows(&rows).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 32);
    }

    #[test]
    fn test_rows_are_causal() {
        let mut layer = random_layer(PvmConfig::enc5());
        let base = random_rows(16, 32, 1.0);
        let mut perturbed = base.clone();
        perturbed[7] = random_rows(1, 32, 3.0).remove(0);
        let a = layer.forward_rows(&base).unwrap();
        let b = layer.forward_rows(&perturbed).unwrap();
        assert_eq!(a[..7], b[..7]);
    }

    #[test]
    fn test_flat_and_f32_entry_points() {
        let config = PvmConfig::enc5();
        let mut rng = rand::thread_rng();
        let flat_weights: Vec<Fixed> = (0..32 * 64 + 64)
            .map(|_| Fixed::from_f64(rng.gen_range(-0.05..0.05)))
            .collect();
        let mut layer = PvmLayer::from_flat_weights(config, &flat_weights).unwrap();
        assert_eq!(layer.projection().to_flat(), flat_weights);

        let input: Vec<f32> = (0..16 * 32).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let from_f32 = layer.forward_f32(&input).unwrap();
        assert_eq!(from_f32.len(), 16 * 64);

        let rows: Vec<FeatureRow> = input
            .chunks_exact(32)
            .map(|r| r.iter().map(|&v| Fixed::from_f32(v)).collect())
            .collect();
        let by_rows: Vec<Fixed> = layer.forward_rows(&rows).unwrap().into_iter().flatten().collect();
        assert_eq!(from_f32, by_rows);
    }

    #[test]
    fn test_input_shape_errors() {
        let mut layer = PvmLayer::new(PvmConfig::enc5(), ProjectionWeights::zeros(32, 64)).unwrap();
        assert_eq!(
            layer.forward_flat(&vec![Fixed::ZERO; 16 * 31]),
            Err(PvmError::LengthMismatch { what: "layer input buffer", expected: 512, got: 496 })
        );
        assert!(matches!(
            layer.forward_rows(&random_rows(15, 32, 1.0)),
            Err(PvmError::LengthMismatch { what: "layer input rows", .. })
        ));
        let mut rows = random_rows(16, 32, 1.0);
        rows[3].pop();
        assert_eq!(
            layer.forward_rows(&rows),
            Err(PvmError::LengthMismatch { what: "layer input row width", expected: 32, got: 31 })
        );
    }

    #[test]
    fn test_construction_errors() {
        let bad_c_in = PvmConfig { c_in: 30, ..PvmConfig::enc5() };
        assert!(matches!(
            PvmLayer::new(bad_c_in, ProjectionWeights::zeros(30, 64)),
            Err(PvmError::InvalidConfig(_))
        ));

        assert!(matches!(
            PvmLayer::from_flat_weights(PvmConfig::enc5(), &[Fixed::ZERO; 100]),
            Err(PvmError::LengthMismatch { what: "projection weights", .. })
        ));

        let mut shallow = PvmConfig::enc5();
        shallow.block.depths = ChannelDepths { residual: 15, ..ChannelDepths::default() };
        assert!(matches!(
            PvmLayer::new(shallow, ProjectionWeights::zeros(32, 64)),
            Err(PvmError::InsufficientBuffering { stream: "residual", .. })
        ));
    }
}
