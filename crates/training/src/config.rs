use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use candle_core::{DType, Device};
use model::{ActivationKind, AlrConfig, NormKind, PositionalEncoding, SamplingConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::{device::DevicePreference, TrainingError};

/// Byte-level vocabulary used when no tokenizer is configured.
pub const BYTE_VOCAB_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    /// Reads a `.toml` or `.json` config and resolves relative paths against
    /// the file's directory. Nothing is validated here; call
    /// [`validate`](Self::validate) once overrides have been applied.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        let model = &self.model;

        for (label, value) in [
            ("model.dim", model.dim),
            ("model.depth", model.depth),
            ("model.dim_head", model.dim_head),
            ("model.heads", model.heads),
        ] {
            if value == 0 {
                errors.push(format!("{label} must be greater than 0"));
            }
        }
        if model.num_tokens == Some(0) {
            errors.push("model.num_tokens must be greater than 0".to_string());
        }
        if !(model.ff_mult.is_finite() && model.ff_mult > 0.0) {
            errors.push("model.ff_mult must be positive".to_string());
        }
        if let Some(mult) = model.alr_mult {
            if !(mult.is_finite() && mult > 0.0) {
                errors.push("model.alr_mult must be positive".to_string());
            }
        }
        for (label, p) in [
            ("model.attn_dropout", model.attn_dropout),
            ("model.ff_dropout", model.ff_dropout),
            ("model.residual_dropout", model.residual_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{label} must be in [0, 1)"));
            }
        }
        if model.positional == PositionalSetting::Rotary && model.dim_head % 2 != 0 {
            errors.push("model.dim_head must be even when rotary positions are enabled".to_string());
        }
        if let Some(max) = model.max_seq_len {
            if max < self.data.seq_len {
                errors.push("model.max_seq_len must be at least data.seq_len".to_string());
            }
        }

        if self.data.train_files.is_empty() {
            errors.push("data.train_files must not be empty".to_string());
        }
        if self.data.seq_len == 0 {
            errors.push("data.seq_len must be greater than 0".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.data.validation_fraction) {
            errors.push("data.validation_fraction must be in [0, 1)".to_string());
        }

        let optimizer = &self.optimizer;
        if optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < optimizer.beta1 && optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < optimizer.beta2 && optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if let Some(norm) = optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push("loss.label_smoothing must be in [0, 1)".to_string());
        }

        let scheduler = &self.scheduler;
        if scheduler.total_steps == 0 {
            errors.push("scheduler.total_steps must be greater than 0".to_string());
        }
        if scheduler.warmup_steps > scheduler.total_steps {
            errors.push("scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string());
        }
        if scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if scheduler.min_lr > optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if scheduler.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        let runtime = &self.runtime;
        if runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if let Some(checkpoint) = &runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_steps == 0 {
                errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
            }
            if checkpoint.max_keep == Some(0) {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }
        if runtime.evaluation.every_n_steps == Some(0) {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }
        if runtime.evaluation.every_n_steps.is_some() && !self.data.has_validation_source() {
            errors.push(
                "runtime.evaluation is enabled but neither data.validation_files nor data.validation_fraction provide validation data"
                    .to_string(),
            );
        }
        if runtime.generation.every_n_steps == Some(0) {
            errors.push("runtime.generation.every_n_steps must be greater than 0".to_string());
        }
        if runtime.generation.prompt_tokens == 0 {
            errors.push("runtime.generation.prompt_tokens must be greater than 0".to_string());
        }
        if let Err(err) = runtime.generation.sampling().validate() {
            errors.push(format!("runtime.generation: {err}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.tokenizer.tokenizer_json.as_mut() {
            absolutize_in_place(path, base);
        }
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    /// Builds the model hyperparameters for a corpus with `vocab_size`
    /// distinct token ids.
    pub fn resolve_model_config(
        &self,
        vocab_size: usize,
        device: &Device,
    ) -> Result<AlrConfig, TrainingError> {
        let model = &self.model;
        let num_tokens = model.num_tokens.unwrap_or(vocab_size);
        if num_tokens < vocab_size {
            return Err(TrainingError::initialization(format!(
                "model.num_tokens ({num_tokens}) is smaller than the tokenizer vocabulary ({vocab_size})"
            )));
        }

        let mut config = AlrConfig::new(model.dim, model.depth, num_tokens)
            .dim_head(model.dim_head)
            .heads(model.heads)
            .ff_mult(model.ff_mult)
            .activation(model.activation.into())
            .gated_ff(model.gated_ff)
            .norm_kind(model.norm.into())
            .positional(model.positional.into())
            .tie_embeddings(model.tie_embeddings)
            .max_seq_len(model.max_seq_len.unwrap_or(self.data.seq_len))
            .dtype(self.runtime.precision.parameter_dtype())
            .device(device.clone());
        if let Some(mult) = model.alr_mult {
            config = config.alr_mult(mult);
        }
        config.rope_theta = model.rope_theta;
        config.attn_dropout = model.attn_dropout;
        config.ff_dropout = model.ff_dropout;
        config.residual_dropout = model.residual_dropout;
        config.residual_scale = model.residual_scale;

        config
            .validate()
            .map_err(|err| TrainingError::initialization(format!("invalid model config: {err}")))?;
        Ok(config)
    }

    /// Applies `key=value` overrides addressed by dot-separated paths such as
    /// `optimizer.learning_rate` or `data.train_files[0]`.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for item in overrides {
            let segments = parse_path(&item.path)?;
            assign_at_path(&mut value, &segments, parse_override_value(&item.value))?;
        }
        serde_json::from_value(value).map_err(|err| {
            TrainingError::ConfigFormat(format!("config invalid after overrides: {err}"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Defaults to the tokenizer vocabulary size.
    #[serde(default)]
    pub num_tokens: Option<usize>,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_ff_mult")]
    pub ff_mult: f32,
    #[serde(default)]
    pub alr_mult: Option<f32>,
    #[serde(default)]
    pub activation: ActivationSetting,
    #[serde(default)]
    pub gated_ff: bool,
    #[serde(default)]
    pub norm: NormSetting,
    #[serde(default)]
    pub positional: PositionalSetting,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub attn_dropout: f32,
    #[serde(default)]
    pub ff_dropout: f32,
    #[serde(default)]
    pub residual_dropout: f32,
    #[serde(default)]
    pub residual_scale: Option<f32>,
    #[serde(default)]
    pub tie_embeddings: bool,
    /// Defaults to `data.seq_len`.
    #[serde(default)]
    pub max_seq_len: Option<usize>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            depth: default_depth(),
            num_tokens: None,
            dim_head: default_dim_head(),
            heads: default_heads(),
            ff_mult: default_ff_mult(),
            alr_mult: None,
            activation: ActivationSetting::default(),
            gated_ff: false,
            norm: NormSetting::default(),
            positional: PositionalSetting::default(),
            rope_theta: default_rope_theta(),
            attn_dropout: 0.0,
            ff_dropout: 0.0,
            residual_dropout: 0.0,
            residual_scale: None,
            tie_embeddings: false,
            max_seq_len: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSetting {
    #[default]
    Gelu,
    Silu,
    Relu,
}

impl From<ActivationSetting> for ActivationKind {
    fn from(value: ActivationSetting) -> Self {
        match value {
            ActivationSetting::Gelu => ActivationKind::Gelu,
            ActivationSetting::Silu => ActivationKind::Silu,
            ActivationSetting::Relu => ActivationKind::Relu,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormSetting {
    #[default]
    LayerNorm,
    RmsNorm,
}

impl From<NormSetting> for NormKind {
    fn from(value: NormSetting) -> Self {
        match value {
            NormSetting::LayerNorm => NormKind::LayerNorm,
            NormSetting::RmsNorm => NormKind::RmsNorm,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalSetting {
    #[default]
    Rotary,
    None,
}

impl From<PositionalSetting> for PositionalEncoding {
    fn from(value: PositionalSetting) -> Self {
        match value {
            PositionalSetting::Rotary => PositionalEncoding::Rotary,
            PositionalSetting::None => PositionalEncoding::None,
        }
    }
}

/// Without a `tokenizer_json` the corpus is read as raw bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_files: Vec<PathBuf>,
    #[serde(default)]
    pub validation_files: Vec<PathBuf>,
    /// Tail share of the training tokens held out when `validation_files` is
    /// empty.
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f32,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    /// Sequences per micro-batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in self
            .train_files
            .iter_mut()
            .chain(self.validation_files.iter_mut())
        {
            absolutize_in_place(path, base);
        }
    }

    pub fn has_validation_source(&self) -> bool {
        !self.validation_files.is_empty() || self.validation_fraction > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    /// Parameters whose name contains any of these fragments skip weight decay.
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
    /// Keep an f32 copy of reduced-precision parameters for the update.
    #[serde(default = "default_true")]
    pub use_master_weights: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: default_weight_decay_exclude(),
            use_master_weights: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub label_smoothing: f32,
    /// Target id left out of the loss. Falls back to the tokenizer's padding
    /// id when unset.
    #[serde(default)]
    pub ignore_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_steps: usize,
    /// Optimizer steps in a full run.
    #[serde(default = "default_total_steps")]
    pub total_steps: usize,
    #[serde(default)]
    pub min_lr: f64,
    /// Exponent of the polynomial schedule.
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_steps: 0,
            total_steps: default_total_steps(),
            min_lr: 0.0,
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            device: DevicePreference::default(),
            log_every_n_steps: default_log_every_n_steps(),
            logging: LoggingConfig::default(),
            checkpoint: None,
            evaluation: EvaluationConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(best) = self.evaluation.best.as_mut() {
            absolutize_in_place(&mut best.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    /// Directory for TensorBoard event files.
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_evaluation_every")]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub max_batches: Option<usize>,
    /// Keeps the checkpoint with the lowest validation loss.
    #[serde(default)]
    pub best: Option<BestCheckpointConfig>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: default_evaluation_every(),
            max_batches: None,
            best: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestCheckpointConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

/// Periodic sample previews primed with a validation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_every")]
    pub every_n_steps: Option<usize>,
    #[serde(default = "default_prompt_tokens")]
    pub prompt_tokens: usize,
    #[serde(default = "default_generation_length")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
}

impl GenerationConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: default_generation_every(),
            prompt_tokens: default_prompt_tokens(),
            max_new_tokens: default_generation_length(),
            temperature: default_temperature(),
            top_k: None,
            top_p: None,
            repetition_penalty: default_repetition_penalty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    /// bf16 parameters updated through f32 master weights.
    Mixed,
}

impl Precision {
    pub fn parameter_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 | Precision::Mixed => DType::BF16,
        }
    }
}

/// One `--override key=value` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return parsed;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| {
            if segment.is_empty() {
                return Err(TrainingError::ConfigFormat(format!(
                    "empty segment in override path '{path}'"
                )));
            }
            match segment.split_once('[') {
                Some((key, rest)) => {
                    let index = rest.trim_end_matches(']').parse::<usize>().map_err(|err| {
                        TrainingError::ConfigFormat(format!(
                            "invalid index in override path '{segment}': {err}"
                        ))
                    })?;
                    Ok(PathSegment {
                        key: key.to_string(),
                        index: Some(index),
                    })
                }
                None => Ok(PathSegment {
                    key: segment.to_string(),
                    index: None,
                }),
            }
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Value::Object(map) = target else {
        return Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    match segment.index {
        None => assign_at_path(entry, rest, new_value),
        Some(index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let Value::Array(items) = entry else {
                return Err(TrainingError::ConfigFormat(format!(
                    "override path segment '{}' expects an array",
                    segment.key
                )));
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            assign_at_path(&mut items[index], rest, new_value)
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_dim() -> usize {
    512
}

fn default_depth() -> usize {
    6
}

fn default_dim_head() -> usize {
    64
}

fn default_heads() -> usize {
    8
}

fn default_ff_mult() -> f32 {
    4.0
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_validation_fraction() -> f32 {
    0.1
}

fn default_seq_len() -> usize {
    512
}

fn default_batch_size() -> usize {
    4
}

fn default_gradient_accumulation_steps() -> usize {
    4
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> Option<f64> {
    Some(0.5)
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string(), "norm".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_total_steps() -> usize {
    100_000
}

fn default_power() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_tensorboard_flush() -> usize {
    10
}

fn default_checkpoint_every() -> usize {
    1_000
}

fn default_evaluation_every() -> Option<usize> {
    Some(100)
}

fn default_generation_every() -> Option<usize> {
    Some(500)
}

fn default_prompt_tokens() -> usize {
    64
}

fn default_generation_length() -> usize {
    256
}

fn default_temperature() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}
