//! Straightforward scaled dot-product attention used by the decoder blocks.

pub mod exact;

pub use exact::ExactAttention;
