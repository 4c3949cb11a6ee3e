//! S6 selective-scan core: one diagonal recurrence per lane.
//!
//! ```text
//! state[d] = exp_decay(delta[d]) * state[d] + delta[d] * B[d] * x[d]
//! y[d]     = C[d] * state[d]
//! ```
//!
//! The state is owned by the core and cleared at the start of every sequence.

use pvm_core::{Fixed, Lanes, RecurrenceParams, TokenVector, LANES};

use crate::activations::exp_decay_approx;

#[derive(Clone, Debug)]
pub struct S6Core {
    lanes: Lanes,
    state: [Fixed; LANES],
}

impl S6Core {
    pub fn new(lanes: Lanes) -> Self {
        Self {
            lanes,
            state: [Fixed::ZERO; LANES],
        }
    }

    pub fn lanes(&self) -> Lanes {
        self.lanes
    }

    /// Zero the recurrent state.
    pub fn begin_sequence(&mut self) {
        self.state = [Fixed::ZERO; LANES];
    }

    pub fn state(&self) -> &[Fixed] {
        &self.state[self.lanes.range()]
    }

    /// Advance the recurrence by one token.
    #[inline]
    pub fn step(&mut self, p: &RecurrenceParams) -> TokenVector {
        let state = &mut self.state;
        TokenVector::from_fn(self.lanes, |d| {
            let dt = p.delta.lane(d);
            let next = exp_decay_approx(dt) * state[d] + dt * p.b.lane(d) * p.x.lane(d);
            state[d] = next;
            p.c.lane(d) * next
        })
    }
}

/// Run a whole sequence through a freshly reset core.
pub fn selective_scan_ref(core: &mut S6Core, params: &[RecurrenceParams]) -> Vec<TokenVector> {
    core.begin_sequence();
    params.iter().map(|p| core.step(p)).collect()
}
