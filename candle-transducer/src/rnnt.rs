//! Unpruned RNN-T lattices.
//!
//! Both constructors reduce the RNN-T problem to the `(px, py)` form consumed
//! by [`mutual_information_recursion`]:
//!
//! - `px[b, s, t]`, shape `[B, S, T+1]`: log-prob of emitting `symbols[b, s]`
//!   from cell `(s, t)`, moving to `(s+1, t)`. The slice `px[:, :, T]` is
//!   `-inf`: no symbol can be emitted on the one-past-the-last frame.
//! - `py[b, s, t]`, shape `[B, S+1, T]`: log-prob of the termination symbol
//!   from cell `(s, t)`, moving to `(s, t+1)`.

use candle::{bail, Result, Tensor};

use crate::mutual_information::mutual_information_recursion;
use crate::normalize::{factored_log_normalizer, log_sum_exp};
use crate::utils::{check_class_ids, check_float, check_termination_symbol, pad_neg_inf, to_index};

/// Builds `(px, py)` for the simple case where the joiner is addition.
///
/// - `lm`: `[B, S+1, C]`, language-model part of the unnormalized logits;
///   `lm[b, s]` scores the next symbol given the symbols before position `s`.
/// - `am`: `[B, T, C]`, acoustic part of the unnormalized logits.
/// - `symbols`: `[B, S]` integer tensor with values in `[0, C)`.
/// - `termination_symbol`: the "next frame" class, in `[0, C)`.
pub fn get_rnnt_logprobs(
    lm: &Tensor,
    am: &Tensor,
    symbols: &Tensor,
    termination_symbol: u32,
) -> Result<(Tensor, Tensor)> {
    const OP: &str = "get_rnnt_logprobs";
    check_float(lm, OP, "lm")?;
    check_float(am, OP, "am")?;
    let (b, t, c) = am.dims3()?;
    let (lm_b, s1, lm_c) = lm.dims3()?;
    if lm_b != b || lm_c != c {
        bail!("{OP}: lm shape {:?} does not match am shape {:?}", lm.dims(), am.dims())
    }
    if s1 == 0 {
        bail!("{OP}: lm must have shape [B, S+1, C], got {:?}", lm.dims())
    }
    if t == 0 {
        bail!("{OP}: am must have at least one frame, got shape {:?}", am.dims())
    }
    let s = s1 - 1;
    if symbols.dims() != [b, s] {
        bail!("{OP}: symbols shape {:?} does not match (B, S) = ({b}, {s})", symbols.dims())
    }
    check_termination_symbol(termination_symbol, c, OP)?;
    let symbols = to_index(symbols, OP, "symbols")?;
    check_class_ids(&symbols, c, OP, "symbols")?;
    let term = termination_symbol as usize;

    // [B, S+1, T]
    let normalizers = factored_log_normalizer(lm, am)?;

    // px_am[b, s, t] = am[b, t, symbols[b, s]]
    let am_t = am.t()?.contiguous()?; // [B, C, T]
    let index = symbols.unsqueeze(2)?.broadcast_as((b, s, t))?.contiguous()?;
    let px_am = am_t.gather(&index, 1)?; // [B, S, T]

    // px_lm[b, s] = lm[b, s, symbols[b, s]]
    let px_lm = lm.narrow(1, 0, s)?.contiguous()?.gather(&symbols.unsqueeze(2)?, 2)?; // [B, S, 1]

    let px = (px_am.broadcast_add(&px_lm)? - normalizers.narrow(1, 0, s)?)?;
    // [B, S, T+1], the slice at T is -inf
    let px = pad_neg_inf(&px, 2, 1)?;

    // [B, S+1, T]
    let py_am = am.narrow(2, term, 1)?.squeeze(2)?.unsqueeze(1)?; // [B, 1, T]
    let py_lm = lm.narrow(2, term, 1)?; // [B, S+1, 1]
    let py = (py_am.broadcast_add(&py_lm)? - normalizers)?;

    Ok((px.contiguous()?, py.contiguous()?))
}

/// RNN-T loss where the joiner is addition, shape `[B]`.
///
/// The values are total log-probs of the symbol sequences (higher is better).
pub fn rnnt_loss_simple(
    lm: &Tensor,
    am: &Tensor,
    symbols: &Tensor,
    termination_symbol: u32,
    boundary: Option<&Tensor>,
) -> Result<Tensor> {
    let (px, py) = get_rnnt_logprobs(lm, am, symbols, termination_symbol)?;
    mutual_information_recursion(&px, &py, boundary)
}

/// Builds `(px, py)` from the output of a joiner network.
///
/// - `joint`: `[B, T, S+1, C]` unnormalized logits.
/// - `symbols`: `[B, S]` integer tensor with values in `[0, C)`.
///
/// For `joint[b, t, s, c] = am[b, t, c] + lm[b, s, c]` this agrees with
/// [`get_rnnt_logprobs`].
pub fn get_rnnt_logprobs_joint(joint: &Tensor, symbols: &Tensor, termination_symbol: u32) -> Result<(Tensor, Tensor)> {
    const OP: &str = "get_rnnt_logprobs_joint";
    check_float(joint, OP, "joint")?;
    let (b, t, s1, c) = joint.dims4()?;
    if s1 == 0 {
        bail!("{OP}: joint must have shape [B, T, S+1, C], got {:?}", joint.dims())
    }
    if t == 0 {
        bail!("{OP}: joint must have at least one frame, got shape {:?}", joint.dims())
    }
    let s = s1 - 1;
    if symbols.dims() != [b, s] {
        bail!("{OP}: symbols shape {:?} does not match (B, S) = ({b}, {s})", symbols.dims())
    }
    check_termination_symbol(termination_symbol, c, OP)?;
    let symbols = to_index(symbols, OP, "symbols")?;
    check_class_ids(&symbols, c, OP, "symbols")?;
    let term = termination_symbol as usize;

    // [B, T, S+1] -> [B, S+1, T]
    let normalizers = log_sum_exp(joint, 3)?.permute((0, 2, 1))?;

    // px[b, s, t] = joint[b, t, s, symbols[b, s]]
    let index = symbols.reshape((b, 1, s, 1))?.broadcast_as((b, t, s, 1))?.contiguous()?;
    let px = joint.narrow(2, 0, s)?.contiguous()?.gather(&index, 3)?.squeeze(3)?; // [B, T, S]
    let px = (px.permute((0, 2, 1))? - normalizers.narrow(1, 0, s)?)?;
    let px = pad_neg_inf(&px, 2, 1)?;

    let py = joint.narrow(3, term, 1)?.squeeze(3)?.permute((0, 2, 1))?; // [B, S+1, T]
    let py = (py - normalizers)?;

    Ok((px.contiguous()?, py.contiguous()?))
}

/// RNN-T loss from the output of a joiner network, shape `[B]`.
pub fn rnnt_loss(
    joint: &Tensor,
    symbols: &Tensor,
    termination_symbol: u32,
    boundary: Option<&Tensor>,
) -> Result<Tensor> {
    let (px, py) = get_rnnt_logprobs_joint(joint, symbols, termination_symbol)?;
    mutual_information_recursion(&px, &py, boundary)
}
