//! RNN-Transducer loss for candle.
//!
//! An RNN-T alignment is a monotone staircase through the `(symbol, frame)`
//! lattice: every step either emits the next symbol or emits the termination
//! symbol and moves to the next frame. This crate turns raw scores into the two
//! per-step log-prob tensors of that lattice and sums over all alignments.
//!
//! | Input | Constructor | Loss |
//! |-------|-------------|------|
//! | `lm [B, S+1, C]` + `am [B, T, C]` | [`get_rnnt_logprobs`] | [`rnnt_loss_simple`] |
//! | `joint [B, T, S+1, C]` | [`get_rnnt_logprobs_joint`] | [`rnnt_loss`] |
//! | pruned `joint [B, T, s_range, C]` | [`get_rnnt_logprobs_pruning`] | [`pruning_rnnt_loss`] |
//!
//! The pruned path restricts each frame to `s_range` symbol positions chosen
//! from the gradients of the simple loss ([`get_pruning_ranges`]), so the joiner
//! only runs on `[B, T, s_range, C]` instead of `[B, T, S+1, C]`.
//!
//! ```no_run
//! use candle::{Device, Tensor};
//! use candle_transducer::{pruning, RnntLoss, RnntLossConfig};
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let (b, s, t, c) = (2, 4, 10, 8);
//! let lm = Tensor::randn(0f32, 1., (b, s + 1, c), &device)?;
//! let am = Tensor::randn(0f32, 1., (b, t, c), &device)?;
//! let symbols = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 1]], &device)?;
//!
//! let loss = RnntLoss::new(RnntLossConfig::new(0).with_prune_range(2));
//! let (simple, ranges) = loss.simple_with_ranges(&lm, &am, &symbols, None)?;
//! let (am_pruned, lm_pruned) = pruning(&am, &lm, &ranges)?;
//! let joint = (am_pruned + lm_pruned)?.tanh()?;
//! let pruned = loss.pruned(&joint, &symbols, &ranges, None)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod loss;
pub mod monotonic;
pub mod mutual_information;
pub mod normalize;
pub mod pruning;
pub mod rnnt;
mod utils;

pub use config::{Reduction, RnntLossConfig};
pub use loss::RnntLoss;
pub use monotonic::monotonic_lower_bound;
pub use mutual_information::{mutual_information_gradients, mutual_information_recursion, Boundary};
pub use normalize::{factored_log_normalizer, log_sum_exp};
pub use pruning::{
    adjust_pruning_lower_bound, full_ranges, get_pruning_ranges, get_rnnt_logprobs_pruning, pruning,
    pruning_rnnt_loss, roll_by_shifts,
};
pub use rnnt::{get_rnnt_logprobs, get_rnnt_logprobs_joint, rnnt_loss, rnnt_loss_simple};
