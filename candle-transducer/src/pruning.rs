//! Pruned RNN-T lattices.
//!
//! The pruned path runs in two phases. A cheap unpruned pass (usually
//! [`crate::rnnt_loss_simple`]) yields gradients with respect to `px`/`py`;
//! [`get_pruning_ranges`] turns them into a window of `s_range` symbol
//! positions per frame. The joiner is then evaluated on [`pruning`]'s gathered
//! `[B, T, s_range, C]` inputs only, and [`get_rnnt_logprobs_pruning`] maps the
//! pruned logits back onto the full lattice with `-inf` outside each window.

use candle::{bail, DType, Device, Result, Tensor};

use crate::monotonic::monotonic_lower_bound_;
use crate::mutual_information::mutual_information_recursion;
use crate::normalize::log_sum_exp;
use crate::utils::{check_class_ids, check_float, check_termination_symbol, pad_neg_inf, to_index};

/// Adjusts one row of window starts in place. See [`adjust_pruning_lower_bound`].
fn adjust_lower_bound_row(row: &mut [i64], s_range: i64) {
    let step = s_range - 1;
    // s_begin[t] <= s_begin[t + 1]
    monotonic_lower_bound_(row);
    // u[t] = t * (s_range - 1) - s_begin[t] is non-decreasing
    // iff s_begin[t + 1] - s_begin[t] <= s_range - 1.
    for (t, v) in row.iter_mut().enumerate() {
        *v = t as i64 * step - *v;
    }
    monotonic_lower_bound_(row);
    // Clamped on the transformed values, so that u[0] = 0 maps back to s_begin[0] = 0.
    for v in row.iter_mut() {
        *v = (*v).max(0);
    }
    for (t, v) in row.iter_mut().enumerate() {
        *v = t as i64 * step - *v;
    }
}

/// Repairs pruning window starts `s_begin` of shape `[B, T]`.
///
/// The result satisfies, for every batch element:
/// - `s_begin[t] <= s_begin[t + 1]`,
/// - `s_begin[0] == 0`, so symbol 0 is reachable on the first frame,
/// - `s_begin[t + 1] - s_begin[t] < s_range`, so no symbol position is skipped.
///
/// The third constraint is enforced by taking the monotonic lower bound of
/// `t * (s_range - 1) - s_begin[t]`, clamping that at zero, and mapping it
/// back through the same transform.
pub fn adjust_pruning_lower_bound(s_begin: &Tensor, s_range: usize) -> Result<Tensor> {
    const OP: &str = "adjust_pruning_lower_bound";
    let (b, t) = s_begin.dims2()?;
    if s_range == 0 {
        bail!("{OP}: s_range must be at least 1")
    }
    let mut rows = to_index(s_begin, OP, "s_begin")?.to_vec2::<i64>()?;
    for row in rows.iter_mut() {
        adjust_lower_bound_row(row, s_range as i64);
    }
    Tensor::from_vec(rows.concat(), (b, t), s_begin.device())
}

/// Index of the first maximum, matching the usual argmax tie-breaking.
fn first_argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in xs.iter().enumerate() {
        if v > xs[best] {
            best = i;
        }
    }
    best
}

/// Chooses, for every frame, the `s_range` symbol positions to keep.
///
/// - `px_grad`: `[B, S, T+1]`, gradient of the unpruned loss with respect to `px`.
/// - `py_grad`: `[B, S+1, T]`, gradient with respect to `py`.
/// - `s_range`: number of symbol positions kept per frame, `1 <= s_range <= S`.
///
/// Returns an `i64` tensor `ranges` of shape `[B, T, s_range]` with
/// `ranges[b, t, i] = s_begin[b, t] + i`, where each window start captures the
/// largest gradient mass on its frame before [`adjust_pruning_lower_bound`]
/// repairs the sequence of starts.
pub fn get_pruning_ranges(px_grad: &Tensor, py_grad: &Tensor, s_range: usize) -> Result<Tensor> {
    const OP: &str = "get_pruning_ranges";
    check_float(px_grad, OP, "px_grad")?;
    check_float(py_grad, OP, "py_grad")?;
    let (b, s, t1) = px_grad.dims3()?;
    if t1 == 0 {
        bail!("{OP}: px_grad must have shape [B, S, T+1], got {:?}", px_grad.dims())
    }
    let t = t1 - 1;
    if py_grad.dims() != [b, s + 1, t] {
        bail!("{OP}: py_grad shape {:?} does not match [{b}, {}, {t}]", py_grad.dims(), s + 1)
    }
    if s_range == 0 || s_range > s {
        bail!("{OP}: s_range must be in [1, S] = [1, {s}], got {s_range}")
    }
    let device = px_grad.device();
    if t == 0 {
        return Tensor::zeros((b, 0, s_range), DType::I64, device);
    }

    // Window masses are summed on the host in f64.
    let dtype = px_grad.dtype();
    let px_grad = px_grad.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
    let py_grad = py_grad.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
    let px_pad = Tensor::zeros((b, 1, t1), DType::F64, &Device::Cpu)?;
    let py_pad = Tensor::zeros((b, s + 1, 1), DType::F64, &Device::Cpu)?;
    // (B, S+1, T+1)
    let tot_grad = (Tensor::cat(&[&px_grad, &px_pad], 1)? + Tensor::cat(&[&py_grad, &py_pad], 2)?)?;
    // Prefix sums over symbol positions: row k holds the mass of positions [0, k).
    let tot_grad = Tensor::cat(&[&px_pad, &tot_grad], 1)?.cumsum(1)?; // (B, S+2, T+1)
    // Mass captured by the window [j, j + s_range), for j in [0, S+1-s_range].
    let num_starts = s + 2 - s_range;
    let diff_grad = (tot_grad.narrow(1, s_range, num_starts)? - tot_grad.narrow(1, 0, num_starts)?)?;
    let diff_grad = diff_grad.narrow(2, 0, t)?.transpose(1, 2)?.to_vec3::<f64>()?; // [B][T][starts]

    let s_begin: Vec<i64> = diff_grad
        .iter()
        .flat_map(|frames| frames.iter().map(|mass| first_argmax(mass) as i64))
        .collect();
    let s_begin = Tensor::from_vec(s_begin, (b, t), device)?;
    let s_begin = adjust_pruning_lower_bound(&s_begin, s_range)?;
    tracing::trace!(?dtype, b, s, t, s_range, "pruning ranges selected");

    let offsets = Tensor::arange(0i64, s_range as i64, device)?.reshape((1, 1, s_range))?;
    s_begin.unsqueeze(2)?.broadcast_add(&offsets)?.contiguous()
}

/// Reads `ranges` to the host, checking that every window is a contiguous run
/// of positions in `[0, S]`.
fn host_ranges(ranges: &Tensor, s: usize, op: &str) -> Result<Vec<i64>> {
    let (_, _, s_range) = ranges.dims3()?;
    let rows = to_index(ranges, op, "ranges")?.flatten_all()?.to_vec1::<i64>()?;
    if s_range == 0 {
        return Ok(rows);
    }
    for window in rows.chunks(s_range) {
        let start = window[0];
        let contiguous = window.iter().zip(start..).all(|(&v, expected)| v == expected);
        if start < 0 || !contiguous || start as usize + s_range - 1 > s {
            bail!("{op}: invalid pruning window {window:?}, expected consecutive positions in [0, {s}]")
        }
    }
    Ok(rows)
}

/// Gathers the pruned encoder and predictor outputs.
///
/// - `am`: `[B, T, C]` encoder output.
/// - `lm`: `[B, S+1, C]` prediction network output.
/// - `ranges`: `[B, T, s_range]` positions kept per frame.
///
/// Returns `(am_pruned, lm_pruned)`, both `[B, T, s_range, C]`: `am` repeated
/// over each window and `lm` taken at the window positions. No normalization
/// happens here; the caller feeds both to its joiner.
pub fn pruning(am: &Tensor, lm: &Tensor, ranges: &Tensor) -> Result<(Tensor, Tensor)> {
    const OP: &str = "pruning";
    let (b, t, c) = am.dims3()?;
    let (lm_b, s1, lm_c) = lm.dims3()?;
    let (r_b, r_t, s_range) = ranges.dims3()?;
    if lm_b != b || r_b != b {
        bail!("{OP}: batch sizes differ, am {:?}, lm {:?}, ranges {:?}", am.dims(), lm.dims(), ranges.dims())
    }
    if r_t != t {
        bail!("{OP}: ranges has {r_t} frames but am has {t}")
    }
    if lm_c != c {
        bail!("{OP}: lm has {lm_c} classes but am has {c}")
    }
    if s1 == 0 {
        bail!("{OP}: lm must have shape [B, S+1, C], got {:?}", lm.dims())
    }
    let rows = host_ranges(ranges, s1 - 1, OP)?;

    // Row index into lm viewed as [B * (S+1), C].
    let frame_len = t * s_range;
    let index: Vec<i64> = rows
        .iter()
        .enumerate()
        .map(|(i, &pos)| (i / frame_len.max(1) * s1) as i64 + pos)
        .collect();
    let index = Tensor::from_vec(index, rows.len(), lm.device())?;
    let lm_pruned = lm
        .reshape((b * s1, c))?
        .index_select(&index, 0)?
        .reshape((b, t, s_range, c))?;
    let am_pruned = am.unsqueeze(2)?.broadcast_as((b, t, s_range, c))?;
    Ok((am_pruned, lm_pruned))
}

/// Rotates every `(b, t)` row of `src` (`[B, T, S]`) along its last dimension
/// by `shifts[b, t]` positions, wrapping around. Positive shifts move elements
/// to higher indices.
///
/// ```text
/// src = [[[ 0,  1,  2,  3,  4],      shifts = [[1, 2, 3]]
///         [ 5,  6,  7,  8,  9],
///         [10, 11, 12, 13, 14]]]
///
/// out = [[[ 4,  0,  1,  2,  3],
///         [ 8,  9,  5,  6,  7],
///         [12, 13, 14, 10, 11]]]
/// ```
pub fn roll_by_shifts(src: &Tensor, shifts: &Tensor) -> Result<Tensor> {
    const OP: &str = "roll_by_shifts";
    let (b, t, s) = src.dims3()?;
    if shifts.dims() != [b, t] {
        bail!("{OP}: shifts shape {:?} does not match [{b}, {t}]", shifts.dims())
    }
    if s == 0 {
        return Ok(src.clone());
    }
    let shifts = to_index(shifts, OP, "shifts")?.flatten_all()?.to_vec1::<i64>()?;
    let width = s as i64;
    let index: Vec<i64> = shifts
        .iter()
        .flat_map(|&shift| (0..width).map(move |j| (j - shift).rem_euclid(width)))
        .collect();
    let index = Tensor::from_vec(index, (b, t, s), src.device())?;
    src.contiguous()?.gather(&index, 2)
}

/// Builds `(px, py)` from the pruned output of a joiner network.
///
/// - `joint`: `[B, T, s_range, C]` logits for the positions in `ranges`.
/// - `symbols`: `[B, S]` integer tensor with values in `[0, C)`.
/// - `ranges`: `[B, T, s_range]`, as returned by [`get_pruning_ranges`].
///
/// Returns `px` of shape `[B, S, T+1]` and `py` of shape `[B, S+1, T]`, with
/// `-inf` at every `(s, t)` whose position `s` lies outside frame `t`'s window.
pub fn get_rnnt_logprobs_pruning(
    joint: &Tensor,
    symbols: &Tensor,
    ranges: &Tensor,
    termination_symbol: u32,
) -> Result<(Tensor, Tensor)> {
    const OP: &str = "get_rnnt_logprobs_pruning";
    check_float(joint, OP, "joint")?;
    let (b, t, s_range, c) = joint.dims4()?;
    if ranges.dims() != [b, t, s_range] {
        bail!("{OP}: ranges shape {:?} does not match joint {:?}", ranges.dims(), joint.dims())
    }
    let (sym_b, s) = symbols.dims2()?;
    if sym_b != b {
        bail!("{OP}: symbols has batch size {sym_b} but joint has {b}")
    }
    if t == 0 {
        bail!("{OP}: joint must have at least one frame, got shape {:?}", joint.dims())
    }
    if s_range > s + 1 {
        bail!("{OP}: pruning window of width {s_range} is wider than the S+1 = {} positions", s + 1)
    }
    check_termination_symbol(termination_symbol, c, OP)?;
    let symbols = to_index(symbols, OP, "symbols")?;
    check_class_ids(&symbols, c, OP, "symbols")?;
    host_ranges(ranges, s, OP)?;
    let ranges = to_index(ranges, OP, "ranges")?;
    let device = joint.device();

    // (B, T, s_range)
    let normalizers = log_sum_exp(joint, 3)?;

    // (B, S+1)
    let terminal = Tensor::full(termination_symbol as i64, (b, 1), device)?;
    let symbols_with_terminal = Tensor::cat(&[&symbols, &terminal], 1)?;
    // Symbol at each window slot's absolute position, (B, T, s_range).
    let pruning_symbols = symbols_with_terminal
        .unsqueeze(1)?
        .broadcast_as((b, t, s + 1))?
        .contiguous()?
        .gather(&ranges, 2)?;

    let shifts = ranges.narrow(2, 0, 1)?.squeeze(2)?; // (B, T)

    // (B, T, s_range)
    let px = joint.contiguous()?.gather(&pruning_symbols.unsqueeze(3)?, 3)?.squeeze(3)?;
    let px = (px - &normalizers)?;
    // Pad to the S+1 positions, move each window to its start, then drop
    // position S, which never emits a symbol.
    let px = pad_neg_inf(&px, 2, s + 1 - s_range)?;
    let px = roll_by_shifts(&px, &shifts)?.narrow(2, 0, s)?; // (B, T, S)
    let px = px.permute((0, 2, 1))?; // (B, S, T)
    let px = pad_neg_inf(&px, 2, 1)?; // (B, S, T+1)

    let py = joint.narrow(3, termination_symbol as usize, 1)?.squeeze(3)?; // (B, T, s_range)
    let py = (py - &normalizers)?;
    let py = pad_neg_inf(&py, 2, s + 1 - s_range)?;
    let py = roll_by_shifts(&py, &shifts)?; // (B, T, S+1)
    let py = py.permute((0, 2, 1))?; // (B, S+1, T)

    Ok((px.contiguous()?, py.contiguous()?))
}

/// RNN-T loss from the pruned output of a joiner network, shape `[B]`.
pub fn pruning_rnnt_loss(
    joint: &Tensor,
    symbols: &Tensor,
    ranges: &Tensor,
    termination_symbol: u32,
    boundary: Option<&Tensor>,
) -> Result<Tensor> {
    let (px, py) = get_rnnt_logprobs_pruning(joint, symbols, ranges, termination_symbol)?;
    mutual_information_recursion(&px, &py, boundary)
}

/// Full, unpruned windows: `ranges[b, t, i] = i` for `i` in `[0, S]`.
pub fn full_ranges(b: usize, t: usize, s: usize, device: &Device) -> Result<Tensor> {
    Tensor::arange(0i64, s as i64 + 1, device)?
        .reshape((1, 1, s + 1))?
        .broadcast_as((b, t, s + 1))?
        .contiguous()
}
