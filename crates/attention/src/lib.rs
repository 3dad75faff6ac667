//! Causal multi-head attention for the decoder half of each ALR layer.
//!
//! Tensors use the `[batch, heads, seq_len, head_dim]` layout. Scores and
//! softmax run in `f32`; the output takes the dtype of `q`. Masks are additive
//! (`0.0` keep, `-inf` drop) and broadcast over batch and heads.

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use reference::ExactAttention;
