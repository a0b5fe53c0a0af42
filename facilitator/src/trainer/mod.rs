mod segment;

use std::{error::Error, fmt};

use comms::msg::{Rank, Tensor};

pub use segment::SegmentTrainer;

/// The result type of the trainer module.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// The compute unit holding the facilitator's model segment.
///
/// Every call is synchronous, the relay doesn't pull the next message until it
/// returns.
pub trait Trainer: Send {
    /// Propagates a client's activations through the segment.
    ///
    /// # Arguments
    /// * `acts` - The activations received from the client.
    /// * `rank_info` - The routing metadata travelling with the activations.
    ///
    /// # Returns
    /// The activations to forward to the server and their routing metadata.
    fn forward_pass(&mut self, acts: Tensor<'_>, rank_info: &[Rank])
    -> Result<(Tensor<'static>, Vec<Rank>)>;

    /// Propagates the server's gradients back through the segment.
    ///
    /// # Returns
    /// The gradients with respect to the segment's input, for the client.
    fn backward_pass(&mut self, grads: Tensor<'_>) -> Result<Tensor<'static>>;

    /// Stops parameter updates until `end_validation` is called.
    fn enter_eval_mode(&mut self) -> Result<()>;

    /// Resumes training after a validation round.
    fn end_validation(&mut self) -> Result<()>;
}

/// Failures of the segment's computation.
#[derive(Debug)]
pub enum TrainErr {
    ShapeMismatch {
        what: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
    MissingForward,
    EvalMode,
    InvalidSpec(String),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} shape mismatch, got {got:?} and expected {expected:?}"),
            TrainErr::MissingForward => {
                f.write_str("backward pass requested with no pending forward pass")
            }
            TrainErr::EvalMode => f.write_str("backward pass requested in eval mode"),
            TrainErr::InvalidSpec(msg) => write!(f, "invalid segment spec: {msg}"),
        }
    }
}

impl Error for TrainErr {}
