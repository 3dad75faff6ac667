use candle_core::{DType, Device, Result, Tensor, D};
use embedding::positional::rope::{Rope, RopeConfig};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn rope_types_are_send_sync() {
    assert_send_sync::<RopeConfig>();
    assert_send_sync::<Rope>();
}

#[test]
fn position_zero_is_identity() -> Result<()> {
    let device = Device::Cpu;
    let rope = Rope::new(RopeConfig::new(8), 4, &device)?;
    let q = Tensor::randn(0f32, 1.0, (1, 2, 1, 8), &device)?;
    let rotated = rope.rotate(&q, 0)?;
    let diff = rotated.sub(&q)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn matches_scalar_reference() -> Result<()> {
    let device = Device::Cpu;
    let head_dim = 4;
    let rope = Rope::new(RopeConfig::new(head_dim), 8, &device)?;
    let values: Vec<f32> = (0..3 * head_dim).map(|v| v as f32 * 0.1 - 0.5).collect();
    let x = Tensor::from_vec(values.clone(), (1, 1, 3, head_dim), &device)?;
    let rotated = rope.rotate(&x, 2)?.flatten_all()?.to_vec1::<f32>()?;

    let half = head_dim / 2;
    for t in 0..3 {
        let pos = (t + 2) as f64;
        for i in 0..half {
            let angle = pos * 10_000f64.powf(-((2 * i) as f64) / head_dim as f64);
            let a = f64::from(values[t * head_dim + i]);
            let b = f64::from(values[t * head_dim + i + half]);
            let expected_a = a * angle.cos() - b * angle.sin();
            let expected_b = a * angle.sin() + b * angle.cos();
            assert!((f64::from(rotated[t * head_dim + i]) - expected_a).abs() < 1e-5);
            assert!((f64::from(rotated[t * head_dim + i + half]) - expected_b).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn rotation_preserves_norm_and_dtype() -> Result<()> {
    let device = Device::Cpu;
    let rope = Rope::new(RopeConfig::new(8), 16, &device)?;
    let q = Tensor::randn(0f32, 1.0, (2, 2, 5, 8), &device)?;
    let k = Tensor::randn(0f32, 1.0, (2, 2, 5, 8), &device)?.to_dtype(DType::BF16)?;
    let (rq, rk) = rope.apply(&q, &k, 3)?;
    assert_eq!(rk.dtype(), DType::BF16);

    let before = q.sqr()?.sum_keepdim(D::Minus1)?;
    let after = rq.sqr()?.sum_keepdim(D::Minus1)?;
    let diff = before.sub(&after)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-4);
    Ok(())
}

#[test]
fn relative_offsets_give_matching_scores() -> Result<()> {
    let device = Device::Cpu;
    let rope = Rope::new(RopeConfig::new(8), 4, &device)?;
    let q = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device)?;
    let k = Tensor::randn(0f32, 1.0, (1, 1, 1, 8), &device)?;

    let score = |q_pos: usize, k_pos: usize| -> Result<f32> {
        let rq = rope.rotate(&q, q_pos)?;
        let rk = rope.rotate(&k, k_pos)?;
        rq.mul(&rk)?.sum_all()?.to_vec0::<f32>()
    };
    assert!((score(5, 2)? - score(13, 10)?).abs() < 1e-4);
    Ok(())
}
