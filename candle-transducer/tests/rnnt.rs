use candle::{test_device, DType, Device, Result, Tensor, Var};
use candle_transducer::{
    get_rnnt_logprobs, get_rnnt_logprobs_joint, mutual_information_recursion, rnnt_loss, rnnt_loss_simple,
};
use rand::prelude::*;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if x.is_infinite() || y.is_infinite() {
            assert_eq!(x, y, "index {i}");
        } else {
            assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
        }
    }
}

fn flat(t: &Tensor) -> Result<Vec<f32>> {
    t.flatten_all()?.to_vec1::<f32>()
}

/// Random values in [-scale, scale]
fn random_tensor(shape: &[usize], scale: f32, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
    let elem_count: usize = shape.iter().product();
    let data: Vec<f32> = (0..elem_count)
        .map(|_| (rng.random::<f32>() * 2. - 1.) * scale)
        .collect();
    Tensor::from_vec(data, shape, device)
}

fn random_symbols(b: usize, s: usize, c: usize, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
    let data: Vec<u32> = (0..b * s).map(|_| rng.random_range(0..c as u32)).collect();
    Tensor::from_vec(data, (b, s), device)
}

fn reference_inputs(dev: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    // lm: [B][S+1][C]
    let lm = Tensor::new(&[[[0f32, 0., 1.], [0., 1., 1.], [1., 0., 1.], [2., 2., 0.]]], dev)?;
    // am: [B][T][C]
    let am = Tensor::new(&[[[0f32, 1., 2.], [0., 0., 0.], [0., 2., 4.], [0., 3., 3.]]], dev)?;
    let symbols = Tensor::new(&[[0u32, 1, 0]], dev)?;
    Ok((lm, am, symbols))
}

/// B=1, S=3, T=4, C=3 with termination symbol 2.
fn rnnt_logprobs_basic(dev: &Device) -> Result<()> {
    let (b, s, t) = (1, 3, 4);
    let termination_symbol = 2;
    let (lm, am, symbols) = reference_inputs(dev)?;

    let (px, py) = get_rnnt_logprobs(&lm, &am, &symbols, termination_symbol)?;
    assert_eq!(px.dims(), [b, s, t + 1]);
    assert_eq!(py.dims(), [b, s + 1, t]);

    let px_v = px.to_vec3::<f32>()?;
    let py_v = py.to_vec3::<f32>()?;
    // lm[0] + am[0] = [0, 1, 3], normalizer = log(1 + e + e^3)
    assert!((px_v[0][0][0] - -3.169_846).abs() < 1e-5);
    assert!((py_v[0][0][0] - -0.169_846).abs() < 1e-5);
    assert!((px_v[0][1][2] - -2.132_845).abs() < 1e-5);
    assert!((py_v[0][3][3] - -2.169_846).abs() < 1e-5);

    let m = mutual_information_recursion(&px, &py, None)?;
    assert_eq!(m.dims(), [b]);
    let m_v = m.to_vec1::<f32>()?;
    assert!((m_v[0] - -7.504_013).abs() < 1e-4, "{m_v:?}");

    // Should be invariant to adding a constant for any frame or position.
    let mut rng = StdRng::seed_from_u64(42);
    let lm2 = lm.broadcast_add(&random_tensor(&[b, s + 1, 1], 3., dev, &mut rng)?)?;
    let am2 = am.broadcast_add(&random_tensor(&[b, t, 1], 3., dev, &mut rng)?)?;
    let m2 = rnnt_loss_simple(&lm2, &am2, &symbols, termination_symbol, None)?;
    assert_close(&m_v, &m2.to_vec1::<f32>()?, 1e-4);
    Ok(())
}

/// A boundary ending at (2, 3) only scores alignments of the prefix.
fn rnnt_loss_boundary(dev: &Device) -> Result<()> {
    let (lm, am, symbols) = reference_inputs(dev)?;
    let boundary = Tensor::new(&[[0i64, 0, 2, 3]], dev)?;
    let m = rnnt_loss_simple(&lm, &am, &symbols, 2, Some(&boundary))?;
    assert!((m.to_vec1::<f32>()?[0] - -2.398_377).abs() < 1e-4);

    let full = Tensor::new(&[[0u32, 0, 3, 4]], dev)?;
    let m_full = rnnt_loss_simple(&lm, &am, &symbols, 2, Some(&full))?;
    let m_none = rnnt_loss_simple(&lm, &am, &symbols, 2, None)?;
    assert_close(&m_full.to_vec1::<f32>()?, &m_none.to_vec1::<f32>()?, 1e-6);
    Ok(())
}

/// Per-row shift invariance on random batched inputs.
fn rnnt_loss_simple_shift_invariance(dev: &Device) -> Result<()> {
    let (b, s, t, c) = (3, 5, 7, 6);
    let mut rng = StdRng::seed_from_u64(299792458);
    let lm = random_tensor(&[b, s + 1, c], 2., dev, &mut rng)?;
    let am = random_tensor(&[b, t, c], 2., dev, &mut rng)?;
    let symbols = random_symbols(b, s, c - 1, dev, &mut rng)?;
    let termination_symbol = (c - 1) as u32;

    let m = rnnt_loss_simple(&lm, &am, &symbols, termination_symbol, None)?;
    let lm2 = lm.broadcast_add(&random_tensor(&[b, s + 1, 1], 10., dev, &mut rng)?)?;
    let am2 = am.broadcast_add(&random_tensor(&[b, t, 1], 10., dev, &mut rng)?)?;
    let m2 = rnnt_loss_simple(&lm2, &am2, &symbols, termination_symbol, None)?;
    assert_close(&m.to_vec1::<f32>()?, &m2.to_vec1::<f32>()?, 1e-3);
    assert!(m.to_vec1::<f32>()?.iter().all(|v| v.is_finite() && *v < 0.));
    Ok(())
}

/// joint[b, t, s, c] = am[b, t, c] + lm[b, s, c] gives the same lattice.
fn rnnt_logprobs_joint_matches_simple(dev: &Device) -> Result<()> {
    let (b, s, t, c) = (2, 4, 6, 5);
    let mut rng = StdRng::seed_from_u64(7);
    let lm = random_tensor(&[b, s + 1, c], 2., dev, &mut rng)?;
    let am = random_tensor(&[b, t, c], 2., dev, &mut rng)?;
    let symbols = random_symbols(b, s, c, dev, &mut rng)?;
    let termination_symbol = 0;

    let joint = am.unsqueeze(2)?.broadcast_add(&lm.unsqueeze(1)?)?; // [B, T, S+1, C]
    let (px, py) = get_rnnt_logprobs(&lm, &am, &symbols, termination_symbol)?;
    let (px_j, py_j) = get_rnnt_logprobs_joint(&joint, &symbols, termination_symbol)?;
    assert_eq!(px_j.dims(), [b, s, t + 1]);
    assert_eq!(py_j.dims(), [b, s + 1, t]);
    assert_close(&flat(&px)?, &flat(&px_j)?, 1e-4);
    assert_close(&flat(&py)?, &flat(&py_j)?, 1e-4);

    let m = rnnt_loss_simple(&lm, &am, &symbols, termination_symbol, None)?;
    let m_j = rnnt_loss(&joint, &symbols, termination_symbol, None)?;
    assert_close(&m.to_vec1::<f32>()?, &m_j.to_vec1::<f32>()?, 1e-4);
    Ok(())
}

/// px[:, :, T] is always -inf, everything else is finite.
fn rnnt_logprobs_terminal_masking(dev: &Device) -> Result<()> {
    let (b, s, t, c) = (2, 3, 4, 5);
    let mut rng = StdRng::seed_from_u64(11);
    let lm = random_tensor(&[b, s + 1, c], 5., dev, &mut rng)?;
    let am = random_tensor(&[b, t, c], 5., dev, &mut rng)?;
    let joint = random_tensor(&[b, t, s + 1, c], 50., dev, &mut rng)?;
    let symbols = random_symbols(b, s, c, dev, &mut rng)?;

    for (px, py) in [
        get_rnnt_logprobs(&lm, &am, &symbols, 1)?,
        get_rnnt_logprobs_joint(&joint, &symbols, 1)?,
    ] {
        let px = px.to_vec3::<f32>()?;
        for row in px.iter().flatten() {
            assert_eq!(row[t], f32::NEG_INFINITY);
            assert!(row[..t].iter().all(|v| v.is_finite() && *v <= 0.));
        }
        assert!(flat(&py)?.iter().all(|v| v.is_finite() && *v <= 0.));
    }
    Ok(())
}

/// Gradients flow back to lm and am through the recursion.
fn rnnt_loss_simple_backward(dev: &Device) -> Result<()> {
    let (b, s, t, c) = (2, 3, 5, 4);
    let mut rng = StdRng::seed_from_u64(3);
    let lm = Var::from_tensor(&random_tensor(&[b, s + 1, c], 1., dev, &mut rng)?)?;
    let am = Var::from_tensor(&random_tensor(&[b, t, c], 1., dev, &mut rng)?)?;
    let symbols = random_symbols(b, s, c, dev, &mut rng)?;

    let loss = rnnt_loss_simple(lm.as_tensor(), am.as_tensor(), &symbols, 0, None)?;
    let grads = loss.sum_all()?.backward()?;
    let lm_grad = grads.get(lm.as_tensor()).expect("no gradient for lm");
    let am_grad = grads.get(am.as_tensor()).expect("no gradient for am");
    assert_eq!(lm_grad.dims(), [b, s + 1, c]);
    assert_eq!(am_grad.dims(), [b, t, c]);
    // Adding a constant to a row leaves the loss unchanged, so each row's
    // gradient sums to zero.
    for grad in [lm_grad, am_grad] {
        let row_sums = grad.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(row_sums.iter().all(|v| v.abs() < 1e-4), "{row_sums:?}");
        assert!(flat(grad)?.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

test_device!(rnnt_logprobs_basic, rnnt_logprobs_basic_cpu, rnnt_logprobs_basic_gpu, rnnt_logprobs_basic_metal);
test_device!(rnnt_loss_boundary, rnnt_loss_boundary_cpu, rnnt_loss_boundary_gpu, rnnt_loss_boundary_metal);
test_device!(
    rnnt_loss_simple_shift_invariance,
    rnnt_loss_simple_shift_invariance_cpu,
    rnnt_loss_simple_shift_invariance_gpu,
    rnnt_loss_simple_shift_invariance_metal
);
test_device!(
    rnnt_logprobs_joint_matches_simple,
    rnnt_logprobs_joint_matches_simple_cpu,
    rnnt_logprobs_joint_matches_simple_gpu,
    rnnt_logprobs_joint_matches_simple_metal
);
test_device!(
    rnnt_logprobs_terminal_masking,
    rnnt_logprobs_terminal_masking_cpu,
    rnnt_logprobs_terminal_masking_gpu,
    rnnt_logprobs_terminal_masking_metal
);
test_device!(
    rnnt_loss_simple_backward,
    rnnt_loss_simple_backward_cpu,
    rnnt_loss_simple_backward_gpu,
    rnnt_loss_simple_backward_metal
);

#[test]
fn rnnt_logprobs_f64() -> Result<()> {
    let dev = &Device::Cpu;
    let (lm, am, symbols) = reference_inputs(dev)?;
    let lm = lm.to_dtype(DType::F64)?;
    let am = am.to_dtype(DType::F64)?;
    let (px, py) = get_rnnt_logprobs(&lm, &am, &symbols, 2)?;
    assert_eq!(px.dtype(), DType::F64);
    let m = mutual_information_recursion(&px, &py, None)?;
    assert_eq!(m.dtype(), DType::F64);
    assert!((m.to_vec1::<f64>()?[0] - -7.504_013_356_021_812).abs() < 1e-9);
    Ok(())
}

#[test]
fn rnnt_logprobs_errors() -> Result<()> {
    let dev = &Device::Cpu;
    let (lm, am, symbols) = reference_inputs(dev)?;

    // class mismatch
    let am4 = Tensor::zeros((1, 4, 4), DType::F32, dev)?;
    assert!(get_rnnt_logprobs(&lm, &am4, &symbols, 2).is_err());
    // batch mismatch
    let am2 = Tensor::zeros((2, 4, 3), DType::F32, dev)?;
    assert!(get_rnnt_logprobs(&lm, &am2, &symbols, 2).is_err());
    // symbols not (B, S)
    let long_symbols = Tensor::new(&[[0u32, 1, 0, 1]], dev)?;
    assert!(get_rnnt_logprobs(&lm, &am, &long_symbols, 2).is_err());
    // symbol id out of range
    let bad_symbols = Tensor::new(&[[0u32, 3, 0]], dev)?;
    assert!(get_rnnt_logprobs(&lm, &am, &bad_symbols, 2).is_err());
    // termination symbol out of range
    assert!(get_rnnt_logprobs(&lm, &am, &symbols, 3).is_err());
    // float symbols
    let float_symbols = symbols.to_dtype(DType::F32)?;
    assert!(get_rnnt_logprobs(&lm, &am, &float_symbols, 2).is_err());

    let joint = Tensor::zeros((1, 4, 3, 3), DType::F32, dev)?; // S + 1 = 3, but symbols has S = 3
    assert!(get_rnnt_logprobs_joint(&joint, &symbols, 2).is_err());

    // boundary beyond the lattice, or with begin > end
    let boundary = Tensor::new(&[[0i64, 0, 4, 4]], dev)?;
    assert!(rnnt_loss_simple(&lm, &am, &symbols, 2, Some(&boundary)).is_err());
    let boundary = Tensor::new(&[[2i64, 0, 1, 4]], dev)?;
    assert!(rnnt_loss_simple(&lm, &am, &symbols, 2, Some(&boundary)).is_err());
    let boundary = Tensor::new(&[[0i64, 0, 3]], dev)?;
    assert!(rnnt_loss_simple(&lm, &am, &symbols, 2, Some(&boundary)).is_err());
    Ok(())
}

#[test]
fn rnnt_logprobs_without_frames() -> Result<()> {
    let dev = &Device::Cpu;
    let (lm, _, symbols) = reference_inputs(dev)?;
    let am = Tensor::zeros((1, 0, 3), DType::F32, dev)?;
    let err = rnnt_loss_simple(&lm, &am, &symbols, 2, None).unwrap_err().to_string();
    assert!(err.contains("get_rnnt_logprobs") && err.contains("at least one frame"), "{err}");

    let joint = Tensor::zeros((1, 0, 4, 3), DType::F32, dev)?;
    let err = rnnt_loss(&joint, &symbols, 2, None).unwrap_err().to_string();
    assert!(err.contains("get_rnnt_logprobs_joint") && err.contains("at least one frame"), "{err}");
    Ok(())
}
