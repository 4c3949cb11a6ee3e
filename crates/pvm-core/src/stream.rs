//! Bounded FIFO streams between pipeline stages.
//!
//! A stream is a `sync_channel` of `(position, item)` pairs with a fixed
//! depth and a fixed sequence length. Writes block while the stream is full,
//! reads block while it is empty. The reader checks that positions arrive as
//! `0, 1, 2, ..` and that exactly `len` items flow through.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread;

use crate::error::PvmError;
use crate::Result;

/// Create a stream of `depth` slots carrying a `len`-token sequence.
///
/// A depth of zero is treated as one slot.
pub fn bounded<T>(name: &'static str, depth: usize, len: usize) -> (StreamWriter<T>, StreamReader<T>) {
    let (tx, rx) = mpsc::sync_channel(depth.max(1));
    (
        StreamWriter { name, tx, len, written: 0 },
        StreamReader { name, rx, len, next: 0 },
    )
}

/// Producing end of a stream.
pub struct StreamWriter<T> {
    name: &'static str,
    tx: SyncSender<(usize, T)>,
    len: usize,
    written: usize,
}

impl<T> StreamWriter<T> {
    /// Push the item for raster position `pos`, blocking while full.
    pub fn write(&mut self, pos: usize, item: T) -> Result<()> {
        if self.written >= self.len {
            return Err(PvmError::StreamOverrun { stream: self.name, expected: self.len });
        }
        self.tx
            .send((pos, item))
            .map_err(|_| PvmError::Disconnected { stream: self.name })?;
        self.written += 1;
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

/// Consuming end of a stream.
pub struct StreamReader<T> {
    name: &'static str,
    rx: Receiver<(usize, T)>,
    len: usize,
    next: usize,
}

impl<T> StreamReader<T> {
    /// Pop the next item, blocking while empty.
    ///
    /// Fails if the writer hung up early or the position is not the next one
    /// in raster order.
    pub fn read(&mut self) -> Result<(usize, T)> {
        if self.next >= self.len {
            return Err(PvmError::StreamOverrun { stream: self.name, expected: self.len });
        }
        let (pos, item) = self.rx.recv().map_err(|_| PvmError::StreamUnderrun {
            stream: self.name,
            expected: self.len,
            got: self.next,
        })?;
        if pos != self.next {
            return Err(PvmError::OutOfOrder { stream: self.name, expected: self.next, got: pos });
        }
        self.next += 1;
        Ok((pos, item))
    }

    /// Confirm the whole sequence was consumed and nothing is left queued.
    ///
    /// Does not block: a writer that is still alive but has nothing queued
    /// counts as drained.
    pub fn finish(self) -> Result<()> {
        if self.next < self.len {
            return Err(PvmError::StreamUnderrun {
                stream: self.name,
                expected: self.len,
                got: self.next,
            });
        }
        match self.rx.try_recv() {
            Ok(_) => Err(PvmError::StreamOverrun { stream: self.name, expected: self.len }),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                tracing::trace!(stream = self.name, tokens = self.len, "stream drained");
                Ok(())
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Items consumed so far.
    pub fn consumed(&self) -> usize {
        self.next
    }
}

/// Check that the items a stage read in lockstep belong to one position.
pub fn aligned(stage: &'static str, positions: &[usize]) -> Result<usize> {
    match positions.split_first() {
        Some((&first, rest)) if rest.iter().all(|&p| p == first) => Ok(first),
        Some(_) => Err(PvmError::PositionSkew { stage, positions: positions.to_vec() }),
        None => Err(PvmError::PositionSkew { stage, positions: Vec::new() }),
    }
}

/// Reduce joined stage results to the first root-cause failure.
///
/// Secondary errors (hung-up channels) are reported only when no stage
/// failed for its own reason.
pub fn first_failure(results: Vec<(&'static str, thread::Result<Result<()>>)>) -> Result<()> {
    let mut secondary = None;
    for (stage, joined) in results {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => PvmError::StagePanicked(stage),
        };
        if !err.is_secondary() {
            return Err(err);
        }
        secondary.get_or_insert(err);
    }
    secondary.map_or(Ok(()), Err)
}
