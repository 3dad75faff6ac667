//! Token lookup and rotary position encoding for the ALR transformer.

pub mod positional;
pub mod token;

pub use positional::rope::{Rope, RopeConfig};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
