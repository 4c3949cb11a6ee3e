//! Block and layer configuration.

use serde::{Deserialize, Serialize};

use pvm_core::{Lanes, PvmError, Result};

/// Which normalizer runs at the head of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    #[default]
    Rms,
    Layer,
}

/// What happens to the convolution history between sequence passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvHistory {
    /// Zeroed at the start of every pass.
    #[default]
    Reset,
    /// Carried into the next pass until `reset()` is called.
    Persist,
}

/// Capacities of a block's internal streams, in tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDepths {
    /// Residual branch, held until fusion. Also sizes the layer's skip stream.
    #[serde(default = "default_sequence_depth")]
    pub residual: usize,
    /// Gate branch, held while the main branch crosses conv and S6.
    #[serde(default = "default_sequence_depth")]
    pub gate: usize,
    /// Every other stage-to-stage stream.
    #[serde(default = "default_internal_depth")]
    pub internal: usize,
}

fn default_sequence_depth() -> usize { 1024 }
fn default_internal_depth() -> usize { 16 }
fn default_rms_eps() -> f64 { 1e-4 }
fn default_layer_eps() -> f64 { 1e-5 }
fn default_skip_scale() -> f32 { 1.0 }

impl Default for ChannelDepths {
    fn default() -> Self {
        Self {
            residual: default_sequence_depth(),
            gate: default_sequence_depth(),
            internal: default_internal_depth(),
        }
    }
}

impl ChannelDepths {
    /// Depths that exactly fit an `seq_len`-token sequence.
    pub fn for_sequence(seq_len: usize) -> Self {
        Self {
            residual: seq_len,
            gate: seq_len,
            internal: default_internal_depth(),
        }
    }

    /// The residual and gate branches must buffer a whole sequence.
    pub fn check(&self, seq_len: usize) -> Result<()> {
        for (stream, depth) in [("residual", self.residual), ("gate", self.gate)] {
            if depth < seq_len {
                return Err(PvmError::InsufficientBuffering { stream, depth, seq_len });
            }
        }
        if self.internal == 0 {
            return Err(PvmError::InvalidConfig("internal stream depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration of one Vision Mamba block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub height: usize,
    pub width: usize,
    /// Active lanes D.
    pub lanes: Lanes,
    #[serde(default)]
    pub norm: NormKind,
    #[serde(default)]
    pub conv_history: ConvHistory,
    #[serde(default)]
    pub depths: ChannelDepths,
    #[serde(default = "default_rms_eps")]
    pub rms_eps: f64,
    #[serde(default = "default_layer_eps")]
    pub layer_eps: f64,
}

impl BlockConfig {
    pub fn new(height: usize, width: usize, lanes: Lanes) -> Self {
        Self {
            height,
            width,
            lanes,
            norm: NormKind::default(),
            conv_history: ConvHistory::default(),
            depths: ChannelDepths::default(),
            rms_eps: default_rms_eps(),
            layer_eps: default_layer_eps(),
        }
    }

    /// Sequence length L = H * W.
    pub fn seq_len(&self) -> usize {
        self.height * self.width
    }

    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.width == 0 {
            return Err(PvmError::InvalidConfig(format!(
                "image must be non-empty, got {}x{}",
                self.height, self.width
            )));
        }
        check_eps("rms_eps", self.rms_eps)?;
        check_eps("layer_eps", self.layer_eps)?;
        self.depths.check(self.seq_len())
    }

    /// A 4x4, 8-lane block for unit tests.
    pub fn tiny() -> Self {
        const TINY_LANES: Lanes = Lanes::literal(8);
        Self::new(4, 4, TINY_LANES)
    }
}

fn check_eps(name: &str, eps: f64) -> Result<()> {
    if eps.is_finite() && eps > 0.0 {
        Ok(())
    } else {
        Err(PvmError::InvalidConfig(format!("{name} must be positive, got {eps}")))
    }
}

/// Options shared by the four blocks of a layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockOptions {
    #[serde(default)]
    pub norm: NormKind,
    #[serde(default)]
    pub conv_history: ConvHistory,
    #[serde(default)]
    pub depths: ChannelDepths,
    #[serde(default = "default_rms_eps")]
    pub rms_eps: f64,
    #[serde(default = "default_layer_eps")]
    pub layer_eps: f64,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            norm: NormKind::default(),
            conv_history: ConvHistory::default(),
            depths: ChannelDepths::default(),
            rms_eps: default_rms_eps(),
            layer_eps: default_layer_eps(),
        }
    }
}

/// Configuration of a chunked PVM layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PvmConfig {
    pub height: usize,
    pub width: usize,
    pub c_in: usize,
    pub c_out: usize,
    /// Weight of the original input in the post-block merge.
    #[serde(default = "default_skip_scale")]
    pub skip_scale: f32,
    /// Epsilon of the two full-row layer norms.
    #[serde(default = "default_layer_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub block: BlockOptions,
}

impl PvmConfig {
    /// Channel chunks, one block each.
    pub const N_CHUNKS: usize = 4;

    /// Deepest encoder stage: 4x4 tokens, 32 -> 64 channels.
    pub fn enc5() -> Self {
        Self {
            height: 4,
            width: 4,
            c_in: 32,
            c_out: 64,
            skip_scale: 1.0,
            norm_eps: default_layer_eps(),
            block: BlockOptions::default(),
        }
    }

    /// Bottleneck decoder stage: a single token, 64 -> 32 channels.
    pub fn dec2() -> Self {
        Self {
            height: 1,
            width: 1,
            c_in: 64,
            c_out: 32,
            ..Self::enc5()
        }
    }

    pub fn seq_len(&self) -> usize {
        self.height * self.width
    }

    /// Channels per chunk, c_in / 4.
    pub fn chunk_dim(&self) -> usize {
        self.c_in / Self::N_CHUNKS
    }

    pub fn validate(&self) -> Result<()> {
        if self.c_in == 0 || self.c_in % Self::N_CHUNKS != 0 {
            return Err(PvmError::InvalidConfig(format!(
                "c_in must be a positive multiple of {}, got {}",
                Self::N_CHUNKS,
                self.c_in
            )));
        }
        if self.c_out == 0 {
            return Err(PvmError::InvalidConfig("c_out must be at least 1".into()));
        }
        if !self.skip_scale.is_finite() {
            return Err(PvmError::InvalidConfig(format!(
                "skip_scale must be finite, got {}",
                self.skip_scale
            )));
        }
        check_eps("norm_eps", self.norm_eps)?;
        self.block_config()?.validate()
    }

    /// The configuration each of the four blocks is built from.
    pub fn block_config(&self) -> Result<BlockConfig> {
        Ok(BlockConfig {
            height: self.height,
            width: self.width,
            lanes: Lanes::new(self.chunk_dim())?,
            norm: self.block.norm,
            conv_history: self.block.conv_history,
            depths: self.block.depths,
            rms_eps: self.block.rms_eps,
            layer_eps: self.block.layer_eps,
        })
    }
}
