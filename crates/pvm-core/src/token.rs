//! Token vectors and the per-token recurrence parameter bundle.

use std::fmt;
use std::ops::{Index, Range};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::PvmError;
use crate::fixed::Fixed;
use crate::Result;

/// Physical lane width of every token vector.
pub const LANES: usize = 32;

/// Widest full-channel row the chunked layer handles (4 chunks of `LANES`).
pub const MAX_ROW_WIDTH: usize = 4 * LANES;

/// One spatial position's full channel vector, stack allocated up to
/// `MAX_ROW_WIDTH` channels.
pub type FeatureRow = SmallVec<[Fixed; MAX_ROW_WIDTH]>;

/// Number of semantically active lanes `D`, validated to `1..=LANES`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Lanes(usize);

impl Lanes {
    /// All 32 lanes active.
    pub const FULL: Lanes = Lanes(LANES);

    pub fn new(d: usize) -> Result<Self> {
        match d {
            0 => Err(PvmError::EmptyLanes),
            d if d > LANES => Err(PvmError::LaneOverflow { lanes: d, max: LANES }),
            d => Ok(Lanes(d)),
        }
    }

    /// Lane count for a literal known to be in range. Use it in a `const`
    /// item so an out-of-range literal fails the build.
    ///
    /// # Panics
    /// If `d` is outside `1..=LANES`.
    pub const fn literal(d: usize) -> Self {
        assert!(d >= 1 && d <= LANES, "lane count must be in 1..=32");
        Lanes(d)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Index range of the active lanes.
    #[inline]
    pub const fn range(self) -> Range<usize> {
        0..self.0
    }
}

impl TryFrom<usize> for Lanes {
    type Error = PvmError;

    fn try_from(d: usize) -> Result<Self> {
        Lanes::new(d)
    }
}

impl From<Lanes> for usize {
    fn from(l: Lanes) -> usize {
        l.0
    }
}

impl fmt::Display for Lanes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One streaming unit: 32 fixed-point lanes, the first `D` active and the
/// rest zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TokenVector {
    lanes: [Fixed; LANES],
}

impl TokenVector {
    pub const fn zeros() -> Self {
        Self { lanes: [Fixed::ZERO; LANES] }
    }

    /// Build from a per-lane function; lanes at or beyond `active` are zero.
    pub fn from_fn(active: Lanes, mut f: impl FnMut(usize) -> Fixed) -> Self {
        let mut lanes = [Fixed::ZERO; LANES];
        for (d, lane) in lanes.iter_mut().enumerate().take(active.get()) {
            *lane = f(d);
        }
        Self { lanes }
    }

    /// Pack up to 32 values into the low lanes, zero-filling the remainder.
    pub fn from_slice(values: &[Fixed]) -> Result<Self> {
        if values.len() > LANES {
            return Err(PvmError::LaneOverflow { lanes: values.len(), max: LANES });
        }
        let mut lanes = [Fixed::ZERO; LANES];
        lanes[..values.len()].copy_from_slice(values);
        Ok(Self { lanes })
    }

    /// Quantize one input position. Values beyond `active` are ignored,
    /// missing ones read as zero.
    pub fn from_f32(values: &[f32], active: Lanes) -> Self {
        Self::from_fn(active, |d| values.get(d).map_or(Fixed::ZERO, |&v| Fixed::from_f32(v)))
    }

    /// Every active lane set to `value`.
    pub fn splat(value: Fixed, active: Lanes) -> Self {
        Self::from_fn(active, |_| value)
    }

    #[inline]
    pub fn lane(&self, d: usize) -> Fixed {
        self.lanes[d]
    }

    #[inline]
    pub fn as_array(&self) -> &[Fixed; LANES] {
        &self.lanes
    }

    /// The first `active` lanes.
    #[inline]
    pub fn active(&self, active: Lanes) -> &[Fixed] {
        &self.lanes[active.range()]
    }

    pub fn iter(&self) -> impl Iterator<Item = Fixed> + '_ {
        self.lanes.iter().copied()
    }

    pub fn is_zero(&self) -> bool {
        self.lanes.iter().all(|&v| v == Fixed::ZERO)
    }

    pub fn any_saturated(&self) -> bool {
        self.lanes.iter().any(|v| v.is_saturated())
    }
}

impl Index<usize> for TokenVector {
    type Output = Fixed;

    fn index(&self, d: usize) -> &Fixed {
        &self.lanes[d]
    }
}

impl fmt::Debug for TokenVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // trailing zero padding is noise
        let used = self
            .lanes
            .iter()
            .rposition(|&v| v != Fixed::ZERO)
            .map_or(0, |i| i + 1);
        f.debug_list()
            .entries(self.lanes[..used].iter().map(|v| v.to_f64()))
            .finish()
    }
}

/// Per-token recurrence inputs produced by the parameter generator and
/// consumed once by the S6 core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RecurrenceParams {
    /// Timestep gate.
    pub delta: TokenVector,
    /// Input coupling.
    pub b: TokenVector,
    /// Output coupling.
    pub c: TokenVector,
    /// Raw (pre-scale) convolved input.
    pub x: TokenVector,
}
