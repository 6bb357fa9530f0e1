//! Mutual-information recursion over the RNN-T lattice.
//!
//! Given `px` of shape `[B, S, T+1]` and `py` of shape `[B, S+1, T]`, this
//! computes for every batch element the log of the summed score of all monotone
//! paths from `(s_begin, t_begin)` to `(s_end, t_end)`:
//!
//! ```text
//! p[b, s_begin, t_begin] = 0
//! p[b, s, t] = log_add(p[b, s-1, t] + px[b, s-1, t],
//!                      p[b, s, t-1] + py[b, s, t-1])
//! ```
//!
//! and returns `p[b, s_end, t_end]`.
//!
//! Forward and backward passes are host kernels running in `f64`, one rayon
//! task per batch element. They are wrapped in a [`CustomOp2`] so that candle's
//! autograd reaches `px` and `py`, and through them whatever produced them.

use candle::{bail, CpuStorage, CustomOp2, DType, Device, Layout, Result, Shape, Tensor};
use rayon::prelude::*;

use crate::utils::{check_float, to_index};

/// Alignment window of one batch element.
///
/// Paths start at `(s_begin, t_begin)` and end at `(s_end, t_end)`; cells
/// outside the window are never visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub s_begin: usize,
    pub t_begin: usize,
    pub s_end: usize,
    pub t_end: usize,
}

impl Boundary {
    /// The whole lattice, `(0, 0, S, T)`.
    pub fn full(s: usize, t: usize) -> Self {
        Self {
            s_begin: 0,
            t_begin: 0,
            s_end: s,
            t_end: t,
        }
    }

    /// Parses a `[B, 4]` tensor of `[s_begin, t_begin, s_end, t_end]` rows.
    ///
    /// A missing tensor yields [`Boundary::full`] for every batch element.
    pub fn from_tensor(boundary: Option<&Tensor>, b: usize, s: usize, t: usize) -> Result<Vec<Self>> {
        let boundary = match boundary {
            Some(boundary) => boundary,
            None => return Ok(vec![Self::full(s, t); b]),
        };
        let dims = boundary.dims();
        if dims != [b, 4] {
            bail!("boundary: expected shape [{b}, 4], got {dims:?}")
        }
        let rows = to_index(boundary, "boundary", "boundary")?.to_vec2::<i64>()?;
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                if row.iter().any(|&v| v < 0) {
                    bail!("boundary: row {i} has negative entries {row:?}")
                }
                let bd = Self {
                    s_begin: row[0] as usize,
                    t_begin: row[1] as usize,
                    s_end: row[2] as usize,
                    t_end: row[3] as usize,
                };
                if bd.s_begin > bd.s_end || bd.t_begin > bd.t_end || bd.s_end > s || bd.t_end > t {
                    bail!("boundary: row {i} {row:?} is not a valid window of the ({s}, {t}) lattice")
                }
                Ok(bd)
            })
            .collect()
    }
}

/// `log(exp(a) + exp(b))`
fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        hi
    } else {
        hi + (lo - hi).exp().ln_1p()
    }
}

/// Host view of one batch element.
struct Lattice<'a> {
    px: &'a [f64],
    py: &'a [f64],
    s: usize,
    t: usize,
}

impl<'a> Lattice<'a> {
    fn new(px: &'a [f64], py: &'a [f64], b: usize, s: usize, t: usize) -> Self {
        let px_len = s * (t + 1);
        let py_len = (s + 1) * t;
        Self {
            px: &px[b * px_len..(b + 1) * px_len],
            py: &py[b * py_len..(b + 1) * py_len],
            s,
            t,
        }
    }

    fn px(&self, s: usize, t: usize) -> f64 {
        self.px[s * (self.t + 1) + t]
    }

    fn py(&self, s: usize, t: usize) -> f64 {
        self.py[s * self.t + t]
    }

    fn cell(&self, s: usize, t: usize) -> usize {
        s * (self.t + 1) + t
    }

    /// Forward scores `alpha[s, t]` over `[S+1, T+1]`.
    fn forward_scores(&self, bd: &Boundary) -> Vec<f64> {
        let mut alpha = vec![f64::NEG_INFINITY; (self.s + 1) * (self.t + 1)];
        for s in bd.s_begin..=bd.s_end {
            for t in bd.t_begin..=bd.t_end {
                alpha[self.cell(s, t)] = if s == bd.s_begin && t == bd.t_begin {
                    0.0
                } else {
                    let from_s = if s > bd.s_begin {
                        alpha[self.cell(s - 1, t)] + self.px(s - 1, t)
                    } else {
                        f64::NEG_INFINITY
                    };
                    let from_t = if t > bd.t_begin {
                        alpha[self.cell(s, t - 1)] + self.py(s, t - 1)
                    } else {
                        f64::NEG_INFINITY
                    };
                    log_add(from_s, from_t)
                };
            }
        }
        alpha
    }

    /// Backward scores `beta[s, t]`: log score of all paths from `(s, t)` to the end.
    fn backward_scores(&self, bd: &Boundary) -> Vec<f64> {
        let mut beta = vec![f64::NEG_INFINITY; (self.s + 1) * (self.t + 1)];
        for s in (bd.s_begin..=bd.s_end).rev() {
            for t in (bd.t_begin..=bd.t_end).rev() {
                beta[self.cell(s, t)] = if s == bd.s_end && t == bd.t_end {
                    0.0
                } else {
                    let to_s = if s < bd.s_end {
                        self.px(s, t) + beta[self.cell(s + 1, t)]
                    } else {
                        f64::NEG_INFINITY
                    };
                    let to_t = if t < bd.t_end {
                        self.py(s, t) + beta[self.cell(s, t + 1)]
                    } else {
                        f64::NEG_INFINITY
                    };
                    log_add(to_s, to_t)
                };
            }
        }
        beta
    }

    fn total(&self, bd: &Boundary) -> f64 {
        self.forward_scores(bd)[self.cell(bd.s_end, bd.t_end)]
    }

    /// Derivatives of the total with respect to `px` and `py`, i.e. the posterior
    /// probability that an alignment takes each step.
    fn occupancy(&self, bd: &Boundary) -> (Vec<f64>, Vec<f64>) {
        let mut px_grad = vec![0.0; self.s * (self.t + 1)];
        let mut py_grad = vec![0.0; (self.s + 1) * self.t];
        let alpha = self.forward_scores(bd);
        let total = alpha[self.cell(bd.s_end, bd.t_end)];
        // No alignment survives: every gradient is zero.
        if total == f64::NEG_INFINITY || total.is_nan() {
            return (px_grad, py_grad);
        }
        let beta = self.backward_scores(bd);
        for s in bd.s_begin..=bd.s_end {
            for t in bd.t_begin..=bd.t_end {
                let a = alpha[self.cell(s, t)];
                if a == f64::NEG_INFINITY {
                    continue;
                }
                if s < bd.s_end {
                    px_grad[s * (self.t + 1) + t] =
                        (a + self.px(s, t) + beta[self.cell(s + 1, t)] - total).exp();
                }
                if t < bd.t_end {
                    py_grad[s * self.t + t] = (a + self.py(s, t) + beta[self.cell(s, t + 1)] - total).exp();
                }
            }
        }
        (px_grad, py_grad)
    }
}

fn storage_to_f64(storage: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
    let (start, end) = match layout.contiguous_offsets() {
        Some(offsets) => offsets,
        None => bail!("mutual_information_recursion: inputs must be contiguous"),
    };
    match storage {
        CpuStorage::F32(vs) => Ok(vs[start..end].iter().map(|&v| v as f64).collect()),
        CpuStorage::F64(vs) => Ok(vs[start..end].to_vec()),
        _ => bail!("mutual_information_recursion: expected f32 or f64 storage"),
    }
}

/// Validates `px`/`py` and returns `(B, S, T)`.
fn lattice_dims(px: &Tensor, py: &Tensor, op: &str) -> Result<(usize, usize, usize)> {
    check_float(px, op, "px")?;
    check_float(py, op, "py")?;
    if px.dtype() != py.dtype() {
        bail!("{op}: px is {:?} but py is {:?}", px.dtype(), py.dtype())
    }
    let (b, s, t1) = px.dims3()?;
    if t1 == 0 {
        bail!("{op}: px must have shape [B, S, T+1], got {:?}", px.dims())
    }
    let t = t1 - 1;
    if py.dims() != [b, s + 1, t] {
        bail!("{op}: py has shape {:?}, expected [{b}, {}, {t}] to match px {:?}", py.dims(), s + 1, px.dims())
    }
    Ok((b, s, t))
}

struct MutualInformation {
    boundaries: Vec<Boundary>,
}

impl CustomOp2 for MutualInformation {
    fn name(&self) -> &'static str {
        "mutual-information-recursion"
    }

    fn cpu_fwd(
        &self,
        px_s: &CpuStorage,
        px_l: &Layout,
        py_s: &CpuStorage,
        py_l: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (b, s, t1) = px_l.shape().dims3()?;
        let t = t1 - 1;
        let px = storage_to_f64(px_s, px_l)?;
        let py = storage_to_f64(py_s, py_l)?;
        let totals: Vec<f64> = (0..b)
            .into_par_iter()
            .map(|i| Lattice::new(&px, &py, i, s, t).total(&self.boundaries[i]))
            .collect();
        let storage = match px_s {
            CpuStorage::F32(_) => CpuStorage::F32(totals.iter().map(|&v| v as f32).collect()),
            _ => CpuStorage::F64(totals),
        };
        Ok((storage, Shape::from(b)))
    }

    fn bwd(
        &self,
        px: &Tensor,
        py: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let (px_grad, py_grad) = occupancy(px, py, &self.boundaries)?;
        let b = grad_res.dim(0)?;
        let scale = grad_res.reshape((b, 1, 1))?;
        Ok((
            Some(px_grad.broadcast_mul(&scale)?),
            Some(py_grad.broadcast_mul(&scale)?),
        ))
    }
}

fn occupancy(px: &Tensor, py: &Tensor, boundaries: &[Boundary]) -> Result<(Tensor, Tensor)> {
    let (b, s, t) = lattice_dims(px, py, "mutual_information_gradients")?;
    let px_host = px.to_device(&Device::Cpu)?.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let py_host = py.to_device(&Device::Cpu)?.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let grads: Vec<(Vec<f64>, Vec<f64>)> = (0..b)
        .into_par_iter()
        .map(|i| Lattice::new(&px_host, &py_host, i, s, t).occupancy(&boundaries[i]))
        .collect();
    let (px_grad, py_grad): (Vec<Vec<f64>>, Vec<Vec<f64>>) = grads.into_iter().unzip();
    let px_grad = Tensor::from_vec(px_grad.concat(), (b, s, t + 1), &Device::Cpu)?
        .to_dtype(px.dtype())?
        .to_device(px.device())?;
    let py_grad = Tensor::from_vec(py_grad.concat(), (b, s + 1, t), &Device::Cpu)?
        .to_dtype(py.dtype())?
        .to_device(py.device())?;
    Ok((px_grad, py_grad))
}

/// Total log score of all alignments, shape `[B]`.
///
/// `boundary`, when given, is a `[B, 4]` integer tensor of
/// `[s_begin, t_begin, s_end, t_end]` rows; it defaults to `[0, 0, S, T]`.
/// The result is differentiable with respect to `px` and `py`.
pub fn mutual_information_recursion(px: &Tensor, py: &Tensor, boundary: Option<&Tensor>) -> Result<Tensor> {
    let (b, s, t) = lattice_dims(px, py, "mutual_information_recursion")?;
    let boundaries = Boundary::from_tensor(boundary, b, s, t)?;
    let device = px.device().clone();
    let px = px.to_device(&Device::Cpu)?.contiguous()?;
    let py = py.to_device(&Device::Cpu)?.contiguous()?;
    let totals = px.apply_op2(&py, MutualInformation { boundaries })?;
    totals.to_device(&device)
}

/// Gradients of each batch element's total with respect to `px` and `py`.
///
/// These are the same values the autograd backward pass produces for a unit
/// incoming gradient, computed directly and without building a graph.
pub fn mutual_information_gradients(
    px: &Tensor,
    py: &Tensor,
    boundary: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let (b, s, t) = lattice_dims(px, py, "mutual_information_gradients")?;
    let boundaries = Boundary::from_tensor(boundary, b, s, t)?;
    occupancy(&px.detach(), &py.detach(), &boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_add_handles_neg_inf() {
        assert_eq!(log_add(f64::NEG_INFINITY, 1.5), 1.5);
        assert_eq!(log_add(1.5, f64::NEG_INFINITY), 1.5);
        assert_eq!(log_add(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!((log_add(0.0, 0.0) - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn single_cell_lattice() {
        // S = 0, T = 0: the only path is empty.
        let lattice = Lattice::new(&[], &[], 0, 0, 0);
        assert_eq!(lattice.total(&Boundary::full(0, 0)), 0.0);
    }

    #[test]
    fn occupancy_is_zero_without_alignments() {
        // S = 1, T = 1, every step forbidden.
        let px = [f64::NEG_INFINITY; 2];
        let py = [f64::NEG_INFINITY; 2];
        let lattice = Lattice::new(&px, &py, 0, 1, 1);
        let bd = Boundary::full(1, 1);
        assert_eq!(lattice.total(&bd), f64::NEG_INFINITY);
        let (gx, gy) = lattice.occupancy(&bd);
        assert!(gx.iter().chain(gy.iter()).all(|&g| g == 0.0));
    }

    #[test]
    fn occupancy_sums_along_every_frame_boundary() {
        // Every path crosses from frame t to t+1 exactly once (one py step per frame).
        let px = [-0.5, -1.0, f64::NEG_INFINITY, -0.2, -0.7, f64::NEG_INFINITY];
        let py = [-0.3, -0.9, -1.1, -0.4, -0.6, -0.8];
        // S = 2, T = 2
        let lattice = Lattice::new(&px, &py, 0, 2, 2);
        let bd = Boundary::full(2, 2);
        let (_, gy) = lattice.occupancy(&bd);
        for t in 0..2 {
            let mass: f64 = (0..3).map(|s| gy[s * 2 + t]).sum();
            assert!((mass - 1.0).abs() < 1e-12, "frame {t}: {mass}");
        }
    }
}
