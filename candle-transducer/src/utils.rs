//! Tensor helpers shared by the lattice constructors.

use candle::{bail, DType, Device, Result, Shape, Tensor};

/// A tensor of the given shape filled with `-inf`.
pub(crate) fn neg_inf<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::full(f64::NEG_INFINITY, shape, device)?.to_dtype(dtype)
}

/// Appends `n` slices of `-inf` to `xs` along `dim`.
pub(crate) fn pad_neg_inf(xs: &Tensor, dim: usize, n: usize) -> Result<Tensor> {
    if n == 0 {
        return Ok(xs.clone());
    }
    let mut dims = xs.dims().to_vec();
    dims[dim] = n;
    let pad = neg_inf(dims, xs.dtype(), xs.device())?;
    Tensor::cat(&[xs, &pad], dim)
}

/// Converts an index tensor (`u8`, `u32` or `i64`) into a contiguous `i64` tensor.
pub(crate) fn to_index(xs: &Tensor, op: &str, name: &str) -> Result<Tensor> {
    match xs.dtype() {
        DType::U8 | DType::U32 | DType::I64 => xs.to_dtype(DType::I64)?.contiguous(),
        dtype => bail!("{op}: {name} must be an integer tensor, got {dtype:?}"),
    }
}

/// Rejects score tensors that are not `f32` or `f64`.
pub(crate) fn check_float(xs: &Tensor, op: &str, name: &str) -> Result<()> {
    match xs.dtype() {
        DType::F32 | DType::F64 => Ok(()),
        dtype => bail!("{op}: {name} must be f32 or f64, got {dtype:?}"),
    }
}

/// Checks that every id in `ids` lies in `[0, num_classes)`.
pub(crate) fn check_class_ids(ids: &Tensor, num_classes: usize, op: &str, name: &str) -> Result<()> {
    let ids = ids.flatten_all()?.to_vec1::<i64>()?;
    if let Some(bad) = ids.iter().find(|&&id| id < 0 || id as usize >= num_classes) {
        bail!("{op}: {name} contains id {bad}, expected values in [0, {num_classes})")
    }
    Ok(())
}

pub(crate) fn check_termination_symbol(termination_symbol: u32, num_classes: usize, op: &str) -> Result<()> {
    if termination_symbol as usize >= num_classes {
        bail!("{op}: termination_symbol {termination_symbol} is out of range for {num_classes} classes")
    }
    Ok(())
}
