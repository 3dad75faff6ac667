//! ALR transformer: a decoder-only language model whose layers pair a
//! position-wise feed-forward attention replacement with a causal decoder
//! block.

pub mod alr;
pub mod block;
pub mod config;
pub mod generation;
pub mod model;

pub use alr::AlrBlock;
pub use block::DecoderBlock;
pub use config::{AlrConfig, PositionalEncoding};
pub use generation::{sample_next_token, SamplingConfig};
pub use model::AlrTransformer;

pub use layers::{activations::ActivationKind, norm::NormKind, NamedParameters};
