//! Vision Mamba block: a seven-stage streaming pipeline over one sequence.
//!
//! ```text
//! input ─ split ─┬──────────────── residual ───────────────┐
//!                └─ norm ─ in_proj ─┬─ main ─ conv ─ param_gen ─ s6 ─ fusion ─ output
//!                                   └──────── gate ─────────────────┘
//! ```
//!
//! Every stage runs on its own scoped thread and talks to its neighbours over
//! bounded position-checked streams. The residual and gate branches bypass the
//! long main branch, so they must buffer a whole sequence.

use std::thread;

use pvm_core::stream::first_failure;
use pvm_core::{bounded, Lanes, PvmError, Result, StreamReader, StreamWriter, TokenVector};

use crate::causal_conv1d::CausalConv1d;
use crate::config::{BlockConfig, ConvHistory, NormKind};
use crate::fusion::GatedFusion;
use crate::norm::{LayerNorm, Normalizer, RmsNorm};
use crate::param_gen::S6ParamGen;
use crate::selective_scan::S6Core;
use crate::stage::{fan_out, map_stage, zip3_stage};
use crate::weights::BlockWeights;

pub struct VisionMambaBlock {
    config: BlockConfig,
    norm: Normalizer,
    conv: CausalConv1d,
    param_gen: S6ParamGen,
    ssm: S6Core,
    fusion: GatedFusion,
    /// Sequences processed since construction.
    passes: u64,
}

impl VisionMambaBlock {
    /// Build with default weights (unit norm scale, 0.33 conv taps).
    pub fn new(config: BlockConfig) -> Result<Self> {
        let weights = BlockWeights::defaults(config.lanes);
        Self::with_weights(config, &weights)
    }

    pub fn with_weights(config: BlockConfig, weights: &BlockWeights) -> Result<Self> {
        config.validate()?;
        let lanes = config.lanes;
        let norm = match config.norm {
            NormKind::Rms => Normalizer::Rms(RmsNorm::with_weight(lanes, &weights.norm)?.with_eps(config.rms_eps)),
            NormKind::Layer => Normalizer::Layer { norm: LayerNorm::with_eps(config.layer_eps), lanes },
        };
        Ok(Self {
            norm,
            conv: CausalConv1d::with_weights(lanes, &weights.conv)?,
            param_gen: S6ParamGen::new(lanes),
            ssm: S6Core::new(lanes),
            fusion: GatedFusion::new(lanes),
            passes: 0,
            config,
        })
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn lanes(&self) -> Lanes {
        self.config.lanes
    }

    pub fn seq_len(&self) -> usize {
        self.config.seq_len()
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Clear all carried state, including a persisted conv history.
    pub fn reset(&mut self) {
        self.conv.reset();
        self.ssm.begin_sequence();
    }

    fn begin_sequence(&mut self) {
        self.ssm.begin_sequence();
        match self.config.conv_history {
            ConvHistory::Reset => self.conv.reset(),
            ConvHistory::Persist if self.conv.has_history() => {
                tracing::debug!(pass = self.passes, "carrying conv history into new sequence");
            }
            ConvHistory::Persist => {}
        }
        self.passes += 1;
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        let expected = self.seq_len();
        if got != expected {
            return Err(PvmError::LengthMismatch { what, expected, got });
        }
        Ok(())
    }

    /// Process one sequence from `input` into `output`.
    ///
    /// Both streams must be sized for exactly `H * W` tokens. Returns after
    /// every stage has finished; on failure the first root-cause error.
    pub fn run(&mut self, input: StreamReader<TokenVector>, output: StreamWriter<TokenVector>) -> Result<()> {
        self.check_len("block input stream", input.len())?;
        self.check_len("block output stream", output.len())?;
        self.begin_sequence();

        let seq_len = self.seq_len();
        let depths = self.config.depths;
        tracing::debug!(seq_len, lanes = self.lanes().get(), pass = self.passes, "block sequence start");

        let (res_tx, res_rx) = bounded("residual", depths.residual, seq_len);
        let (norm_in_tx, norm_in_rx) = bounded("norm_in", depths.internal, seq_len);
        let (normed_tx, normed_rx) = bounded("normed", depths.internal, seq_len);
        let (main_tx, main_rx) = bounded("main", depths.internal, seq_len);
        let (gate_tx, gate_rx) = bounded("gate", depths.gate, seq_len);
        let (conv_tx, conv_rx) = bounded("conv_out", depths.internal, seq_len);
        let (params_tx, params_rx) = bounded("params", depths.internal, seq_len);
        let (ssm_tx, ssm_rx) = bounded("ssm_out", depths.internal, seq_len);

        let Self { norm, conv, param_gen, ssm, fusion, .. } = &mut *self;
        let (norm, param_gen, fusion) = (&*norm, &*param_gen, &*fusion);

        let results = thread::scope(|s| {
            let stages = [
                ("split", s.spawn(move || fan_out("split", input, res_tx, norm_in_tx))),
                ("norm", s.spawn(move || map_stage("norm", norm_in_rx, normed_tx, |x| norm.forward(&x)))),
                ("in_proj", s.spawn(move || fan_out("in_proj", normed_rx, main_tx, gate_tx))),
                ("conv", s.spawn(move || map_stage("conv", main_rx, conv_tx, |x| conv.step(&x)))),
                (
                    "param_gen",
                    s.spawn(move || map_stage("param_gen", conv_rx, params_tx, |x| param_gen.forward(&x))),
                ),
                ("s6", s.spawn(move || map_stage("s6", params_rx, ssm_tx, |p| ssm.step(&p)))),
                (
                    "fusion",
                    s.spawn(move || {
                        zip3_stage("fusion", ssm_rx, gate_rx, res_rx, output, |y, g, r| fusion.forward(&y, &g, &r))
                    }),
                ),
            ];
            stages.into_iter().map(|(name, h)| (name, h.join())).collect::<Vec<_>>()
        });

        let result = first_failure(results);
        match &result {
            Ok(()) => tracing::debug!(seq_len, pass = self.passes, "block sequence done"),
            Err(e) => tracing::debug!(error = %e, pass = self.passes, "block sequence failed"),
        }
        result
    }

    /// Run one sequence given as a slice.
    pub fn forward(&mut self, tokens: &[TokenVector]) -> Result<Vec<TokenVector>> {
        self.check_len("block input tokens", tokens.len())?;
        let seq_len = self.seq_len();
        let depth = self.config.depths.internal;
        let (mut feed, input) = bounded("block_in", depth, seq_len);
        let (output, mut drain) = bounded("block_out", depth, seq_len);

        thread::scope(|s| {
            let feeder = s.spawn(move || -> Result<()> {
                for (pos, &token) in tokens.iter().enumerate() {
                    feed.write(pos, token)?;
                }
                Ok(())
            });
            let collector = s.spawn(move || -> Result<Vec<TokenVector>> {
                let mut out = Vec::with_capacity(seq_len);
                for _ in 0..seq_len {
                    out.push(drain.read()?.1);
                }
                drain.finish()?;
                Ok(out)
            });
            let ran = self.run(input, output);
            first_failure(vec![("block", Ok(ran)), ("feed", feeder.join())])?;
            collector.join().map_err(|_| PvmError::StagePanicked("collect"))?
        })
    }

    /// Single-threaded equivalent of [`VisionMambaBlock::forward`]: the same
    /// stages applied token by token.
    pub fn forward_sequential(&mut self, tokens: &[TokenVector]) -> Result<Vec<TokenVector>> {
        self.check_len("block input tokens", tokens.len())?;
        self.begin_sequence();
        Ok(tokens
            .iter()
            .map(|x| {
                let normed = self.norm.forward(x);
                let conv = self.conv.step(&normed);
                let params = self.param_gen.forward(&conv);
                let y = self.ssm.step(&params);
                self.fusion.forward(&y, &normed, x)
            })
            .collect())
    }
}
