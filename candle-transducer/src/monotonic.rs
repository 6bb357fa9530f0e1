//! Monotonic lower bound of integer sequences.

use candle::{bail, Result, Tensor};

use crate::utils::to_index;

/// Replaces `row` in place by the largest non-decreasing sequence that is
/// point-wise `<=` the input: `row[i] = min(row[i], row[i + 1])`, scanning
/// from the end.
pub(crate) fn monotonic_lower_bound_(row: &mut [i64]) {
    let mut min = i64::MAX;
    for v in row.iter_mut().rev() {
        min = min.min(*v);
        *v = min;
    }
}

/// Monotonic lower bound along the last dimension of an integer tensor.
///
/// The result is an `i64` tensor of the same shape. Indices are kept at 64 bits
/// so sequence lengths are not limited by a 32-bit intermediate.
pub fn monotonic_lower_bound(src: &Tensor) -> Result<Tensor> {
    let n = match src.dims().last() {
        Some(&n) => n,
        None => bail!("monotonic_lower_bound: expected at least one dimension"),
    };
    let mut data = to_index(src, "monotonic_lower_bound", "src")?
        .flatten_all()?
        .to_vec1::<i64>()?;
    if n > 0 {
        for row in data.chunks_mut(n) {
            monotonic_lower_bound_(row);
        }
    }
    Tensor::from_vec(data, src.shape().clone(), src.device())
}
