//! Config-driven front end over the loss functions.

use candle::{bail, Result, Tensor};

use crate::config::RnntLossConfig;
use crate::mutual_information::{mutual_information_gradients, mutual_information_recursion};
use crate::pruning::{full_ranges, get_pruning_ranges, pruning_rnnt_loss};
use crate::rnnt::{get_rnnt_logprobs, rnnt_loss};

/// RNN-T loss with a fixed termination symbol, prune range and reduction.
///
/// All methods return total log-probs of the symbol sequences, reduced as
/// configured.
#[derive(Debug, Clone)]
pub struct RnntLoss {
    config: RnntLossConfig,
    span: tracing::Span,
}

impl RnntLoss {
    pub fn new(config: RnntLossConfig) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "rnnt-loss");
        Self { config, span }
    }

    pub fn config(&self) -> &RnntLossConfig {
        &self.config
    }

    /// Loss for separable scores, `lm` `[B, S+1, C]` and `am` `[B, T, C]`.
    pub fn simple(&self, lm: &Tensor, am: &Tensor, symbols: &Tensor, boundary: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        tracing::debug!(lm = ?lm.dims(), am = ?am.dims(), "simple rnnt loss");
        let (px, py) = get_rnnt_logprobs(lm, am, symbols, self.config.termination_symbol)?;
        let values = mutual_information_recursion(&px, &py, boundary)?;
        self.config.reduction.apply(&values)
    }

    /// Loss for the output of a joiner, `joint` `[B, T, S+1, C]`.
    pub fn full(&self, joint: &Tensor, symbols: &Tensor, boundary: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        tracing::debug!(joint = ?joint.dims(), "full rnnt loss");
        let values = rnnt_loss(joint, symbols, self.config.termination_symbol, boundary)?;
        self.config.reduction.apply(&values)
    }

    /// Loss for a pruned joiner output, `joint` `[B, T, s_range, C]`.
    pub fn pruned(
        &self,
        joint: &Tensor,
        symbols: &Tensor,
        ranges: &Tensor,
        boundary: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        tracing::debug!(joint = ?joint.dims(), "pruned rnnt loss");
        let values = pruning_rnnt_loss(joint, symbols, ranges, self.config.termination_symbol, boundary)?;
        self.config.reduction.apply(&values)
    }

    /// First phase of the pruned path: the simple loss together with the
    /// pruning ranges derived from its gradients.
    ///
    /// The prune range is capped at `S` for short symbol sequences. Empty
    /// symbol sequences (`S = 0`) get the single window `[0]` on every frame.
    pub fn simple_with_ranges(
        &self,
        lm: &Tensor,
        am: &Tensor,
        symbols: &Tensor,
        boundary: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (px, py) = get_rnnt_logprobs(lm, am, symbols, self.config.termination_symbol)?;
        let values = mutual_information_recursion(&px, &py, boundary)?;
        let (px_grad, py_grad) = mutual_information_gradients(&px, &py, boundary)?;
        if self.config.prune_range == 0 {
            bail!("simple_with_ranges: prune_range must be at least 1")
        }
        let (b, s, t1) = px.dims3()?;
        let s_range = self.config.prune_range.min(s);
        tracing::debug!(lm = ?lm.dims(), am = ?am.dims(), s_range, "simple rnnt loss with pruning ranges");
        let ranges = if s == 0 {
            full_ranges(b, t1 - 1, 0, px.device())?
        } else {
            get_pruning_ranges(&px_grad, &py_grad, s_range)?
        };
        Ok((self.config.reduction.apply(&values)?, ranges))
    }
}
