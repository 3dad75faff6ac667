use super::*;
use candle_core::{Device, Result};

fn idx(b: usize, h: usize, q: usize, k: usize, dims: [usize; 4]) -> usize {
    let [_, heads, q_len, k_len] = dims;
    (((b * heads + h) * q_len + q) * k_len) + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let dims = [1, 2, 3, 5];
    let mask = build_causal_mask(&device, 1, 2, 3, 5)?;
    assert_eq!(mask.dims(), &dims);
    assert_eq!(mask.dtype(), MASK_DTYPE);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 0, 2, dims)], 0.0);
    assert_eq!(values[idx(0, 0, 0, 3, dims)], f32::NEG_INFINITY);
    assert_eq!(values[idx(0, 1, 2, 4, dims)], 0.0);
    Ok(())
}

#[test]
fn square_causal_mask_is_lower_triangular() -> Result<()> {
    let mask = build_causal_mask(&Device::Cpu, 1, 1, 3, 3)?;
    let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
    let inf = f32::NEG_INFINITY;
    assert_eq!(
        rows,
        vec![vec![0.0, inf, inf], vec![0.0, 0.0, inf], vec![0.0, 0.0, 0.0]]
    );
    Ok(())
}

#[test]
fn causal_mask_handles_single_token_cases() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 1, 1, 1, 4)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 4]);

    let dims = [1, 1, 4, 2];
    let values = build_causal_mask(&device, 1, 1, 4, 2)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 0, 1, dims)], f32::NEG_INFINITY);
    assert_eq!(values[idx(0, 0, 3, 1, dims)], 0.0);
    Ok(())
}

#[test]
fn padding_mask_masks_tail() -> Result<()> {
    let dims = [2, 1, 3, 5];
    let mask = padding_mask_from_lengths(&Device::Cpu, &[2, 7], 1, 3, 5)?;
    assert_eq!(mask.dims(), &dims);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 0, 2, dims)], f32::NEG_INFINITY);
    assert_eq!(values[idx(0, 0, 1, 1, dims)], 0.0);
    assert_eq!(values[idx(1, 0, 2, 4, dims)], 0.0);
    Ok(())
}

#[test]
fn causal_and_padding_masks_compose() -> Result<()> {
    let device = Device::Cpu;
    let dims = [1, 1, 3, 5];
    let combined = build_causal_mask(&device, 1, 1, 3, 5)?
        .add(&padding_mask_from_lengths(&device, &[3], 1, 3, 5)?)?;
    let values = combined.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 2, 4, dims)], f32::NEG_INFINITY);
    assert_eq!(values[idx(0, 0, 1, 1, dims)], 0.0);
    Ok(())
}
