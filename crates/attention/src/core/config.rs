/// Run-time knobs shared by attention kernels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Dropout on attention probabilities. `None` disables it; callers pass
    /// `None` outside of training.
    pub dropout_p: Option<f32>,
}

impl Config {
    pub fn with_dropout(dropout_p: f32) -> Self {
        Self {
            dropout_p: (dropout_p > 0.0).then_some(dropout_p),
        }
    }
}
