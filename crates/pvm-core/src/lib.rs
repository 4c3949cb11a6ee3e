//! # pvm-core
//!
//! Numeric and streaming primitives for the PVM pipeline:
//! a saturating 18-bit fixed-point scalar, 32-lane token vectors and
//! bounded, position-checked FIFO streams. CPU only.

pub mod error;
pub mod fixed;
pub mod stream;
pub mod token;

pub use error::PvmError;
pub use fixed::Fixed;
pub use stream::{bounded, StreamReader, StreamWriter};
pub use token::{FeatureRow, Lanes, RecurrenceParams, TokenVector, LANES, MAX_ROW_WIDTH};

pub type Result<T> = std::result::Result<T, PvmError>;
