use candle_core::{Device, Result, Tensor};

/// Masks keys at or beyond each batch element's valid length.
///
/// Lengths larger than `k_len` are clamped. The result is
/// `[batch, num_heads, q_len, k_len]`.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let rows: Vec<f32> = key_lengths
        .iter()
        .flat_map(|&valid| {
            let valid = valid.min(k_len);
            (0..k_len).map(move |k| if k >= valid { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(rows, (batch, 1, 1, k_len), device)?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}
