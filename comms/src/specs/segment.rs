use serde::{Deserialize, Serialize};

/// The specification for an activation function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActFnSpec {
    Sigmoid { amp: f32 },
}

/// The specification for a single layer of a model segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Dense {
        dim: (usize, usize),
        act_fn: Option<ActFnSpec>,
    },
}

impl LayerSpec {
    /// The input and output widths of this layer.
    pub fn dim(&self) -> (usize, usize) {
        match *self {
            LayerSpec::Dense { dim, .. } => dim,
        }
    }
}

/// The specification for the optimizer updating a segment's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    GradientDescent { learning_rate: f32 },
}

/// The specification for the model segment held by the facilitator.
///
/// Consecutive layers must chain, the output width of one being the input width
/// of the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub layers: Vec<LayerSpec>,
    pub optimizer: OptimizerSpec,
    pub seed: Option<u64>,
}
