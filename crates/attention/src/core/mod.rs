//! Trait and shared types for attention kernels.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, heads, k_len, head_dim]`.
/// * Masks are shaped `[1|batch, 1|heads, q_len, k_len]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
