//! Loss configuration.

use candle::{Result, Tensor};
use serde::Deserialize;

/// How per-sequence values are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Keep one value per batch element, shape `[B]`.
    #[default]
    None,
    /// Sum over the batch.
    Sum,
    /// Mean over the batch.
    Mean,
}

impl Reduction {
    pub fn apply(&self, values: &Tensor) -> Result<Tensor> {
        match self {
            Self::None => Ok(values.clone()),
            Self::Sum => values.sum_all(),
            Self::Mean => values.mean_all(),
        }
    }
}

/// Configuration of [`crate::RnntLoss`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RnntLossConfig {
    /// Class id meaning "advance one frame without emitting a symbol".
    #[serde(default = "default_termination_symbol")]
    pub termination_symbol: u32,
    /// Number of symbol positions kept per frame on the pruned path.
    #[serde(default = "default_prune_range")]
    pub prune_range: usize,
    #[serde(default)]
    pub reduction: Reduction,
}

fn default_termination_symbol() -> u32 {
    0 // blank
}
fn default_prune_range() -> usize {
    5
}

impl Default for RnntLossConfig {
    fn default() -> Self {
        Self {
            termination_symbol: default_termination_symbol(),
            prune_range: default_prune_range(),
            reduction: Reduction::None,
        }
    }
}

impl RnntLossConfig {
    pub fn new(termination_symbol: u32) -> Self {
        Self {
            termination_symbol,
            ..Self::default()
        }
    }

    pub fn with_prune_range(mut self, prune_range: usize) -> Self {
        self.prune_range = prune_range;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }
}
