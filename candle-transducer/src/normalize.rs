//! Log-domain normalizers.
//!
//! Both variants subtract a maximum before exponentiating and add it back once
//! the sum is taken, so large logits neither overflow nor underflow. The maxima
//! are detached from the autograd graph: they cancel analytically.

use candle::shape::Dim;
use candle::{Result, Tensor, D};

/// Normalizer for the separable case, where the joiner is plain addition.
///
/// Returns `normalizers[b, s, t] = log(sum_c exp(lm[b, s, c] + am[b, t, c]))`
/// with shape `[B, S+1, T]`. Rather than materializing the `[B, S+1, T, C]`
/// sum, the exponentiated scores are contracted over `C` with a batched matmul.
pub fn factored_log_normalizer(lm: &Tensor, am: &Tensor) -> Result<Tensor> {
    // am_max: [B, T, 1], lm_max: [B, S+1, 1]
    let am_max = am.max_keepdim(D::Minus1)?.detach();
    let lm_max = lm.max_keepdim(D::Minus1)?.detach();
    let am_probs = am.broadcast_sub(&am_max)?.exp()?;
    let lm_probs = lm.broadcast_sub(&lm_max)?.exp()?;

    // [B, S+1, C] x [B, C, T] -> [B, S+1, T]
    let normalizers = (lm_probs.matmul(&am_probs.t()?.contiguous()?)? + 1e-20)?.log()?;

    // Put back the maxima as if they had never been subtracted.
    normalizers
        .broadcast_add(&lm_max)?
        .broadcast_add(&am_max.t()?)
}

/// Log-sum-exp over `dim`, removing that dimension.
///
/// Slices that are entirely `-inf` reduce to `-inf`.
pub fn log_sum_exp<T: Dim>(xs: &Tensor, dim: T) -> Result<Tensor> {
    let dim = dim.to_index(xs.shape(), "log_sum_exp")?;
    let max = xs.max_keepdim(dim)?.detach();
    // -inf - -inf would be NaN, shift those slices by zero instead.
    let finite = max.abs()?.lt(f64::INFINITY)?;
    let max = finite.where_cond(&max, &max.zeros_like()?)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    sum.log()?.broadcast_add(&max)?.squeeze(dim)
}
