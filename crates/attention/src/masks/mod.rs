//! Additive attention masks with dtype [`MASK_DTYPE`].
//!
//! Entries are `0.0` where attention is permitted and `f32::NEG_INFINITY`
//! otherwise. Masks combine by addition.

pub mod causal;
pub mod padding;

use candle_core::DType;

pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::padding_mask_from_lengths;

#[cfg(test)]
mod tests;
