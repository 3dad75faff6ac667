use candle_core::{Device, Result, Tensor};

/// Builds a `[batch, num_heads, q_len, k_len]` causal mask.
///
/// Queries align with the last `q_len` keys, so query `q` may see keys up to
/// `q + (k_len - q_len)`. Pass `batch = num_heads = 1` to get a mask that
/// broadcasts over any batch and head count.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let pattern: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    let pattern = Tensor::from_vec(pattern, (1, 1, q_len, k_len), device)?;
    if batch == 1 && num_heads == 1 {
        Ok(pattern)
    } else {
        pattern
            .broadcast_as((batch, num_heads, q_len, k_len))?
            .contiguous()
    }
}
