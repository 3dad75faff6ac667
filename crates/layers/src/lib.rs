//! Building blocks for the ALR transformer layers.
//!
//! Every component consumes hidden states shaped `(batch, seq, hidden)` and
//! keeps its trainable state in [`candle_core::Var`]s so the training crate
//! can differentiate through them and checkpoint them by name.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use dtypes::PrecisionPolicy;

use candle_core::Var;

/// Named trainable tensors, keyed by their dotted checkpoint path.
pub type NamedParameters = Vec<(String, Var)>;

/// Joins a parent scope and a child name into a dotted parameter path.
pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
