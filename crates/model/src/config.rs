use candle_core::{DType, Device, Error, Result};
use layers::{activations::ActivationKind, norm::NormKind};

/// How token positions reach the decoder attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalEncoding {
    /// No positional signal beyond causal masking.
    None,
    /// Rotary embeddings applied to queries and keys.
    Rotary,
}

/// Hyperparameters for [`AlrTransformer`](crate::AlrTransformer).
///
/// `AlrConfig::new(dim, depth, num_tokens)` fills the remaining knobs with
/// `dim_head = 64`, `heads = 8` and `ff_mult = 4`; builder setters override
/// them.
#[derive(Debug, Clone)]
pub struct AlrConfig {
    pub dim: usize,
    pub depth: usize,
    pub num_tokens: usize,
    pub dim_head: usize,
    pub heads: usize,
    pub ff_mult: f32,
    /// Expansion of the attention replacement network; `None` reuses `ff_mult`.
    pub alr_mult: Option<f32>,
    pub activation: ActivationKind,
    pub gated_ff: bool,
    pub norm_kind: NormKind,
    pub norm_eps: f64,
    pub positional: PositionalEncoding,
    pub rope_theta: f32,
    pub attn_dropout: f32,
    pub ff_dropout: f32,
    pub residual_dropout: f32,
    /// Scales every sublayer output before the residual add.
    pub residual_scale: Option<f32>,
    pub tie_embeddings: bool,
    /// Longest accepted input sequence; `None` leaves it unbounded.
    pub max_seq_len: Option<usize>,
    pub dtype: DType,
    pub device: Device,
}

impl AlrConfig {
    pub fn new(dim: usize, depth: usize, num_tokens: usize) -> Self {
        Self {
            dim,
            depth,
            num_tokens,
            dim_head: 64,
            heads: 8,
            ff_mult: 4.0,
            alr_mult: None,
            activation: ActivationKind::Gelu,
            gated_ff: false,
            norm_kind: NormKind::LayerNorm,
            norm_eps: 1e-5,
            positional: PositionalEncoding::Rotary,
            rope_theta: 10_000.0,
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            residual_dropout: 0.0,
            residual_scale: None,
            tie_embeddings: false,
            max_seq_len: None,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn dim_head(mut self, dim_head: usize) -> Self {
        self.dim_head = dim_head;
        self
    }

    pub fn heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn ff_mult(mut self, ff_mult: f32) -> Self {
        self.ff_mult = ff_mult;
        self
    }

    pub fn alr_mult(mut self, alr_mult: f32) -> Self {
        self.alr_mult = Some(alr_mult);
        self
    }

    pub fn activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn gated_ff(mut self, gated: bool) -> Self {
        self.gated_ff = gated;
        self
    }

    pub fn norm_kind(mut self, kind: NormKind) -> Self {
        self.norm_kind = kind;
        self
    }

    pub fn positional(mut self, positional: PositionalEncoding) -> Self {
        self.positional = positional;
        self
    }

    /// Sets attention, feed-forward and residual dropout at once.
    pub fn dropout(mut self, p: f32) -> Self {
        self.attn_dropout = p;
        self.ff_dropout = p;
        self.residual_dropout = p;
        self
    }

    pub fn residual_scale(mut self, scale: f32) -> Self {
        self.residual_scale = Some(scale);
        self
    }

    pub fn tie_embeddings(mut self, tie: bool) -> Self {
        self.tie_embeddings = tie;
        self
    }

    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Width of the concatenated attention heads.
    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    pub fn effective_alr_mult(&self) -> f32 {
        self.alr_mult.unwrap_or(self.ff_mult)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dim", self.dim),
            ("depth", self.depth),
            ("num_tokens", self.num_tokens),
            ("dim_head", self.dim_head),
            ("heads", self.heads),
        ] {
            if value == 0 {
                return Err(Error::Msg(format!("{name} must be greater than zero")));
            }
        }
        if !(self.ff_mult.is_finite() && self.ff_mult > 0.0) {
            return Err(Error::Msg(format!("ff_mult must be positive, got {}", self.ff_mult)));
        }
        let alr_mult = self.effective_alr_mult();
        if !(alr_mult.is_finite() && alr_mult > 0.0) {
            return Err(Error::Msg(format!("alr_mult must be positive, got {alr_mult}")));
        }
        for (name, p) in [
            ("attn_dropout", self.attn_dropout),
            ("ff_dropout", self.ff_dropout),
            ("residual_dropout", self.residual_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        if self.positional == PositionalEncoding::Rotary && self.dim_head % 2 != 0 {
            return Err(Error::Msg(format!(
                "rotary positions need an even dim_head, got {}",
                self.dim_head
            )));
        }
        if let Some(scale) = self.residual_scale {
            if !scale.is_finite() {
                return Err(Error::Msg(format!("residual_scale must be finite, got {scale}")));
            }
        }
        if self.max_seq_len == Some(0) {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(Error::Msg(format!(
                "parameter dtype must be f32, f16 or bf16, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}

impl Default for AlrConfig {
    fn default() -> Self {
        Self::new(512, 6, 100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_usage_snippet() {
        let config = AlrConfig::default();
        assert_eq!(
            (config.dim, config.depth, config.num_tokens, config.dim_head, config.heads),
            (512, 6, 100_000, 64, 8)
        );
        assert_eq!(config.ff_mult, 4.0);
        assert_eq!(config.effective_alr_mult(), 4.0);
        assert_eq!(config.inner_dim(), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(AlrConfig::new(0, 1, 10).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).ff_mult(0.0).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).alr_mult(-1.0).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).dropout(1.0).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).dim_head(3).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10)
            .dim_head(3)
            .positional(PositionalEncoding::None)
            .validate()
            .is_ok());
        assert!(AlrConfig::new(8, 1, 10).max_seq_len(0).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).dtype(DType::U32).validate().is_err());
        assert!(AlrConfig::new(8, 1, 10).residual_scale(f32::INFINITY).validate().is_err());
    }
}
