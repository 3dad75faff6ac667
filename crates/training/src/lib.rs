//! Language-model training for the ALR transformer: configuration, corpora,
//! AdamW with loss scaling, schedules, checkpoints and the training loop.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, TrainingProgressSnapshot};
pub use config::{ConfigOverride, Precision, TrainingConfig};
pub use data::{DataBatch, DataLoader, RandomWindowLoader, SequentialWindowLoader, TextCodec, TokenCorpus};
pub use device::{select_device, DevicePreference};
pub use error::TrainingError;
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::EvaluationSummary;
pub use optimizer::{AdamWConfig, GradientScaler, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::Trainer;
