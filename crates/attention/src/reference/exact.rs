use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{dropout, softmax};

use crate::core::{Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

/// Scaled dot-product attention computed with plain tensor ops.
///
/// Every step is differentiable, so the kernel is used for training as well
/// as inference.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::exact init dtype={:?} dropout={:?} masked={}",
                q.dtype(),
                config.dropout_p,
                mask.is_some()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }
        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must be [batch, heads, seq_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must be [batch, heads, seq_len, head_dim]"))?;
        let (vb, vh, vk, vd) = v
            .dims4()
            .map_err(|_| AttentionError::shape("v must be [batch, heads, seq_len, head_dim]"))?;
        if (kb, kh, kd) != (batch, heads, head_dim) {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if (vb, vh, vk, vd) != (batch, heads, k_len, head_dim) {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }

        let q32 = q.to_dtype(DType::F32)?.contiguous()?;
        let k32 = k.to_dtype(DType::F32)?.contiguous()?;
        let v32 = v.to_dtype(DType::F32)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = q32.matmul(&k32.t()?.contiguous()?)?.affine(scale, 0.0)?;

        if let Some(mask) = mask {
            validate_mask(mask, (batch, heads, q_len, k_len))?;
            if !device.same_device(mask.device()) {
                return Err(AttentionError::shape("mask must reside on the same device as q"));
            }
            scores = scores.broadcast_add(mask)?;
        }

        let mut probs = softmax(&scores, D::Minus1)?;
        if let Some(p) = config.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::shape(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            if p > 0.0 {
                probs = dropout(&probs, p)?;
            }
        }

        Ok(probs.matmul(&v32)?.to_dtype(dtype)?)
    }
}

fn validate_mask(
    mask: &Tensor,
    (batch, heads, q_len, k_len): (usize, usize, usize, usize),
) -> Result<(), AttentionError> {
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask expects {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let (mb, mh, mq, mk) = mask
        .dims4()
        .map_err(|_| AttentionError::shape("mask must be [batch|1, heads|1, q_len, k_len]"))?;
    let batch_ok = mb == 1 || mb == batch;
    let heads_ok = mh == 1 || mh == heads;
    if !batch_ok || !heads_ok || mq != q_len || mk != k_len {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [1|{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
        )));
    }
    Ok(())
}
