//! Configuration and SafeTensors weight loading for PVM layers.
//!
//! Tensor keys under a layer prefix:
//! - `{prefix}.proj.weight` (c_out, c_in)
//! - `{prefix}.proj.bias` (c_out,)
//! - `{prefix}.blocks.{i}.norm.weight` (D,), optional
//! - `{prefix}.blocks.{i}.conv.weight` (3, D), optional
//!
//! F32, F16 and BF16 tensors are accepted and quantized on load.

use std::path::Path;

use safetensors::SafeTensors;

use pvm_core::{Fixed, Lanes, PvmError};

use crate::causal_conv1d::KERNEL_SIZE;
use crate::config::PvmConfig;
use crate::weights::{BlockWeights, ProjectionWeights, PvmWeights};

/// Error type for configuration and weight loading.
#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    SafeTensors(String),
    Config(String),
    MissingKey(String),
    ShapeMismatch { key: String, expected: Vec<usize>, got: Vec<usize> },
    UnsupportedDtype { key: String, dtype: String },
    Invalid(PvmError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "IO error: {}", e),
            LoadError::SafeTensors(s) => write!(f, "SafeTensors error: {}", s),
            LoadError::Config(s) => write!(f, "Config error: {}", s),
            LoadError::MissingKey(k) => write!(f, "Missing key: {}", k),
            LoadError::ShapeMismatch { key, expected, got } =>
                write!(f, "Shape mismatch for {}: expected {:?}, got {:?}", key, expected, got),
            LoadError::UnsupportedDtype { key, dtype } =>
                write!(f, "Unsupported dtype {} for {}", dtype, key),
            LoadError::Invalid(e) => write!(f, "Invalid weights: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self { LoadError::Io(e) }
}

impl From<PvmError> for LoadError {
    fn from(e: PvmError) -> Self { LoadError::Invalid(e) }
}

/// Load and validate a [`PvmConfig`] from a JSON file.
pub fn load_config(path: &Path) -> Result<PvmConfig, LoadError> {
    let text = std::fs::read_to_string(path)?;
    let config: PvmConfig = serde_json::from_str(&text).map_err(|e| LoadError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Convert a SafeTensors tensor view to Vec<f32>.
fn tensor_to_f32(key: &str, view: &safetensors::tensor::TensorView<'_>) -> Result<Vec<f32>, LoadError> {
    let data = view.data();
    match view.dtype() {
        safetensors::Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        safetensors::Dtype::F16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect()),
        safetensors::Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect()),
        other => Err(LoadError::UnsupportedDtype {
            key: key.to_string(),
            dtype: format!("{:?}", other),
        }),
    }
}

/// Read `key`, check its shape and quantize it.
fn get_tensor(tensors: &SafeTensors<'_>, key: &str, shape: &[usize]) -> Result<Vec<Fixed>, LoadError> {
    let view = tensors.tensor(key).map_err(|_| LoadError::MissingKey(key.to_string()))?;
    if view.shape() != shape {
        return Err(LoadError::ShapeMismatch {
            key: key.to_string(),
            expected: shape.to_vec(),
            got: view.shape().to_vec(),
        });
    }
    Ok(tensor_to_f32(key, &view)?.into_iter().map(Fixed::from_f32).collect())
}

/// Like [`get_tensor`], but a missing key is `None`.
fn get_tensor_opt(tensors: &SafeTensors<'_>, key: &str, shape: &[usize]) -> Result<Option<Vec<Fixed>>, LoadError> {
    match tensors.tensor(key) {
        Ok(_) => get_tensor(tensors, key, shape).map(Some),
        Err(_) => Ok(None),
    }
}

/// Build layer weights from an in-memory SafeTensors buffer.
///
/// Block tensors that are absent keep their defaults.
pub fn load_weights_from_bytes(data: &[u8], prefix: &str, config: &PvmConfig) -> Result<PvmWeights, LoadError> {
    config.validate()?;
    let tensors = SafeTensors::deserialize(data).map_err(|e| LoadError::SafeTensors(e.to_string()))?;

    let (c_in, c_out) = (config.c_in, config.c_out);
    let weight = get_tensor(&tensors, &format!("{}.proj.weight", prefix), &[c_out, c_in])?;
    let bias = get_tensor(&tensors, &format!("{}.proj.bias", prefix), &[c_out])?;
    let mut flat = weight;
    flat.extend(bias);
    let projection = ProjectionWeights::from_flat(c_in, c_out, &flat)?;

    let lanes = Lanes::new(config.chunk_dim())?;
    let d = lanes.get();
    let mut blocks = Vec::with_capacity(PvmConfig::N_CHUNKS);
    for i in 0..PvmConfig::N_CHUNKS {
        let mut w = BlockWeights::defaults(lanes);
        if let Some(norm) = get_tensor_opt(&tensors, &format!("{}.blocks.{}.norm.weight", prefix, i), &[d])? {
            w.norm = norm;
        }
        if let Some(conv) = get_tensor_opt(&tensors, &format!("{}.blocks.{}.conv.weight", prefix, i), &[KERNEL_SIZE, d])? {
            w.conv = conv;
        }
        blocks.push(w);
    }

    tracing::debug!(prefix, c_in, c_out, "loaded layer weights");
    Ok(PvmWeights { projection, blocks })
}

/// Build layer weights from a `.safetensors` file.
pub fn load_weights(path: &Path, prefix: &str, config: &PvmConfig) -> Result<PvmWeights, LoadError> {
    let data = std::fs::read(path)?;
    load_weights_from_bytes(&data, prefix, config)
}

/// List all tensor keys in a `.safetensors` file, sorted.
pub fn list_keys(path: &Path) -> Result<Vec<String>, LoadError> {
    let data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data).map_err(|e| LoadError::SafeTensors(e.to_string()))?;
    let mut keys: Vec<String> = tensors.names().into_iter().cloned().collect();
    keys.sort();
    Ok(keys)
}
