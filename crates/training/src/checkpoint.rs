use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Tensor};
use hex::encode as hex_encode;
use model::AlrTransformer;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_TENSORS_FILENAME: &str = "optimizer.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const DIRECTORY_PREFIX: &str = "step_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Where training stood when the checkpoint was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingProgressSnapshot {
    pub optimizer_step: usize,
    /// Micro-batches pulled from the training loader, used to fast-forward it.
    pub micro_batches_drawn: u64,
    pub micro_batches_per_step: usize,
    pub tokens_processed: u64,
    #[serde(default)]
    pub best_eval_loss: Option<f64>,
    #[serde(default)]
    pub last_eval_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub master_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub optimizer_tensors: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
}

impl CheckpointManifest {
    fn records(&self) -> [&FileRecord; 5] {
        [
            &self.model,
            &self.optimizer,
            &self.optimizer_tensors,
            &self.scheduler,
            &self.scaler,
        ]
    }
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a AlrTransformer,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Everything read back from a verified checkpoint directory.
pub struct LoadOutcome {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub optimizer_tensors: HashMap<String, Tensor>,
    pub scheduler_state: SchedulerState,
    pub scaler_state: GradientScalerState,
    pub model_weights_path: PathBuf,
}

pub fn checkpoint_dir_name(optimizer_step: usize) -> String {
    format!("{DIRECTORY_PREFIX}{optimizer_step:012}")
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(checkpoint_dir_name(request.progress.optimizer_step));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;

    let optimizer_tensors_path = checkpoint_dir.join(OPTIMIZER_TENSORS_FILENAME);
    save_tensors(&request.optimizer.state_tensors(), &optimizer_tensors_path)?;

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state())?;

    let scheduler_path = checkpoint_dir.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.snapshot())?;

    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: file_record(&model_path)?,
        optimizer: file_record(&optimizer_path)?,
        optimizer_tensors: file_record(&optimizer_tensors_path)?,
        scheduler: file_record(&scheduler_path)?,
        scaler: file_record(&scaler_path)?,
        progress: request.progress,
        rng: request.rng,
    };

    // The manifest goes last: a directory without one is an interrupted save.
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;
    log::info!(
        "saved checkpoint for step {} to {}",
        manifest.progress.optimizer_step,
        checkpoint_dir.display()
    );

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Most recent complete checkpoint under `base_dir`, if any.
pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let mut dirs = checkpoint_directories(base_dir)?;
    dirs.sort();
    while let Some(path) = dirs.pop() {
        if !path.join(MANIFEST_FILENAME).is_file() {
            log::warn!("skipping incomplete checkpoint {}", path.display());
            continue;
        }
        let manifest = load_manifest(&path)?;
        return Ok(Some(CheckpointDescriptor {
            directory: path,
            manifest,
        }));
    }
    Ok(None)
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;
    for record in manifest.records() {
        validate_file(&directory.join(&record.filename), &record.sha256)?;
    }

    let optimizer_state: OptimizerState = read_json(&directory.join(&manifest.optimizer.filename))?;
    let optimizer_tensors = safetensors::load(
        directory.join(&manifest.optimizer_tensors.filename),
        &candle_core::Device::Cpu,
    )?;
    let scheduler_state: SchedulerState = read_json(&directory.join(&manifest.scheduler.filename))?;
    let scaler_state: GradientScalerState = read_json(&directory.join(&manifest.scaler.filename))?;
    let model_weights_path = directory.join(&manifest.model.filename);

    Ok(LoadOutcome {
        directory: directory.to_path_buf(),
        manifest,
        optimizer_state,
        optimizer_tensors,
        scheduler_state,
        scaler_state,
        model_weights_path,
    })
}

/// Copies the tensors in a `model.safetensors` file into `model`'s variables.
/// Names and shapes must match exactly.
pub fn apply_model_weights(model: &AlrTransformer, weights_path: &Path) -> Result<(), TrainingError> {
    let device = model.config().device.clone();
    let mut by_name = safetensors::load(weights_path, &device)?;

    for (name, var) in model.parameters() {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        let tensor = if tensor.dtype() == var.dtype() {
            tensor
        } else {
            tensor.to_dtype(var.dtype())?
        };
        var.set(&tensor)?;
    }

    if !by_name.is_empty() {
        let mut extra = by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)?;
    Ok(hex_encode(Sha256::digest(json)))
}

/// Removes the oldest checkpoint directories until at most `max_keep` remain.
pub fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(limit) = max_keep.filter(|limit| *limit > 0) else {
        return Ok(());
    };
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    let excess = dirs.len().saturating_sub(limit);
    for victim in dirs.into_iter().take(excess) {
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
        log::debug!("pruned checkpoint {}", victim.display());
    }
    Ok(())
}

fn save_model_weights(model: &AlrTransformer, path: &Path) -> Result<(), TrainingError> {
    let tensors: HashMap<String, Tensor> = model
        .parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    save_tensors(&tensors, path)
}

fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    safetensors::save(tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize tensors to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(DIRECTORY_PREFIX) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
