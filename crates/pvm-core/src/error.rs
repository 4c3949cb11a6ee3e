use thiserror::Error;

/// Structural failures of the streaming core.
///
/// Arithmetic never fails (it saturates); everything here is a violated
/// configuration or stream-length precondition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PvmError {
    #[error("Active lane count {lanes} exceeds the {max}-lane token width")]
    LaneOverflow { lanes: usize, max: usize },

    #[error("Active lane count must be at least 1")]
    EmptyLanes,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stream '{stream}' depth {depth} cannot buffer a {seq_len}-token sequence")]
    InsufficientBuffering {
        stream: &'static str,
        depth: usize,
        seq_len: usize,
    },

    #[error("Stream '{stream}' ended after {got} of {expected} tokens")]
    StreamUnderrun {
        stream: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Stream '{stream}' carried more than {expected} tokens")]
    StreamOverrun { stream: &'static str, expected: usize },

    #[error("Stream '{stream}' delivered position {got}, expected {expected}")]
    OutOfOrder {
        stream: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Stage '{stage}' inputs disagree on position: {positions:?}")]
    PositionSkew {
        stage: &'static str,
        positions: Vec<usize>,
    },

    #[error("Stream '{stream}' lost its peer")]
    Disconnected { stream: &'static str },

    #[error("{what}: expected {expected} values, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Pipeline stage '{0}' panicked")]
    StagePanicked(&'static str),
}

impl PvmError {
    /// Whether this error only reports that some other stage went away.
    ///
    /// When a pipeline fails, every stage downstream or upstream of the
    /// failing one observes a hung-up channel; drivers use this to surface
    /// the root cause instead.
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            PvmError::Disconnected { .. } | PvmError::StreamUnderrun { .. }
        )
    }
}
