use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttentionError {
    /// Tensor shapes or devices do not match the kernel contract.
    #[error("invalid attention input: {context}")]
    InvalidShape { context: String },
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    #[error("attention backend failure: {0}")]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
