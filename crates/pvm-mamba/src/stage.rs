//! Stage loops shared by the block and layer pipelines.
//!
//! Each function is the body of one pipeline thread: it consumes exactly
//! `len` items from its input streams, emits one item per token and returns
//! once the inputs are confirmed drained.

use pvm_core::stream::aligned;
use pvm_core::{Result, StreamReader, StreamWriter};

/// Read from `input` and emit `f(item)` in order.
pub fn map_stage<A, B>(
    name: &'static str,
    mut input: StreamReader<A>,
    mut output: StreamWriter<B>,
    mut f: impl FnMut(A) -> B,
) -> Result<()> {
    for _ in 0..input.len() {
        let (pos, item) = input.read()?;
        output.write(pos, f(item))?;
    }
    tracing::trace!(stage = name, tokens = input.len(), "stage done");
    input.finish()
}

/// Copy every item to two outputs, `first` before `second`.
pub fn fan_out<T: Clone>(
    name: &'static str,
    mut input: StreamReader<T>,
    mut first: StreamWriter<T>,
    mut second: StreamWriter<T>,
) -> Result<()> {
    for _ in 0..input.len() {
        let (pos, item) = input.read()?;
        first.write(pos, item.clone())?;
        second.write(pos, item)?;
    }
    tracing::trace!(stage = name, tokens = input.len(), "stage done");
    input.finish()
}

/// Join three lockstep inputs of the same position into one output.
pub fn zip3_stage<A, B, C, D>(
    name: &'static str,
    mut a: StreamReader<A>,
    mut b: StreamReader<B>,
    mut c: StreamReader<C>,
    mut output: StreamWriter<D>,
    mut f: impl FnMut(A, B, C) -> D,
) -> Result<()> {
    for _ in 0..output.len() {
        let (pa, va) = a.read()?;
        let (pb, vb) = b.read()?;
        let (pc, vc) = c.read()?;
        let pos = aligned(name, &[pa, pb, pc])?;
        output.write(pos, f(va, vb, vc))?;
    }
    tracing::trace!(stage = name, tokens = output.len(), "stage done");
    a.finish()?;
    b.finish()?;
    c.finish()
}
