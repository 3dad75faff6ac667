//! Public face of the workspace: the ALR transformer model and the helpers a
//! caller needs to run it.

pub use model::{
    ActivationKind, AlrBlock, AlrConfig, AlrTransformer, DecoderBlock, NamedParameters, NormKind,
    PositionalEncoding, SamplingConfig,
};
pub use training::{select_device, DevicePreference};

/// Hyperparameters of the reference usage example.
pub mod defaults {
    pub const DIM: usize = 512;
    pub const DEPTH: usize = 6;
    pub const NUM_TOKENS: usize = 100_000;
    pub const DIM_HEAD: usize = 64;
    pub const HEADS: usize = 8;
    pub const FF_MULT: f32 = 4.0;
    pub const SEQ_LEN: usize = 2048;
}

/// `AlrConfig` with every default from [`defaults`].
pub fn default_config() -> AlrConfig {
    AlrConfig::new(defaults::DIM, defaults::DEPTH, defaults::NUM_TOKENS)
        .dim_head(defaults::DIM_HEAD)
        .heads(defaults::HEADS)
        .ff_mult(defaults::FF_MULT)
}
