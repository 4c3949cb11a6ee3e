//! # pvm-mamba
//!
//! Streaming fixed-point Vision Mamba block and the channel-chunked PVM layer
//! built from four of them.
//!
//! A block turns an `H * W` sequence of token vectors into a sequence of the
//! same shape: normalize, causal conv, selective scan, gated residual fusion.
//! A layer normalizes full `c_in`-channel rows, runs one block per quarter of
//! the channels concurrently, merges with a skip connection and projects to
//! `c_out` channels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pvm_core::{FeatureRow, Fixed};
//! use pvm_mamba::{ProjectionWeights, PvmConfig, PvmLayer};
//!
//! let config = PvmConfig::enc5(); // 4x4 tokens, 32 -> 64 channels
//! let projection = ProjectionWeights::random_uniform(32, 64, &mut rand::thread_rng());
//! let mut layer = PvmLayer::new(config, projection).unwrap();
//!
//! let rows = vec![FeatureRow::from_elem(Fixed::from_f64(0.05), 32); 16];
//! let out = layer.forward_rows(&rows).unwrap();
//! assert_eq!(out[0].len(), 64);
//! ```

pub mod activations;
pub mod causal_conv1d;
pub mod config;
pub mod fusion;
pub mod loader;
pub mod norm;
pub mod param_gen;
pub mod pvm_layer;
pub mod selective_scan;
pub mod stage;
pub mod vision_mamba;
pub mod weights;

pub use activations::{exp_decay_approx, silu_approx, sigmoid_approx, softplus_approx, EXP_DECAY_SAMPLES};
pub use causal_conv1d::{causal_conv1d_fn, CausalConv1d};
pub use config::{BlockConfig, BlockOptions, ChannelDepths, ConvHistory, NormKind, PvmConfig};
pub use fusion::GatedFusion;
pub use loader::{load_config, load_weights, load_weights_from_bytes, LoadError};
pub use norm::{LayerNorm, Normalizer, RmsNorm};
pub use param_gen::S6ParamGen;
pub use pvm_layer::PvmLayer;
pub use selective_scan::{selective_scan_ref, S6Core};
pub use vision_mamba::VisionMambaBlock;
pub use weights::{BlockWeights, ProjectionWeights, PvmWeights};
