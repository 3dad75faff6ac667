use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::tempdir;
use training::{
    checkpoint::latest_checkpoint, ConfigOverride, Trainer, TrainingConfig, TrainingError,
};

fn write_corpus(dir: &Path) -> PathBuf {
    let text = (0..48)
        .map(|i| format!("line {i}: the quick brown fox jumps over the lazy dog"))
        .collect::<Vec<_>>()
        .join("\n");
    let path = dir.join("train.txt");
    fs::write(&path, text).unwrap();
    path
}

fn write_config(dir: &Path, total_steps: usize) -> PathBuf {
    write_corpus(dir);
    let config = format!(
        r#"
[model]
dim = 16
depth = 1
dim_head = 8
heads = 2

[data]
train_files = ["train.txt"]
validation_fraction = 0.2
seq_len = 16
batch_size = 2
gradient_accumulation_steps = 2

[optimizer]
learning_rate = 1e-3
max_grad_norm = 1.0

[scheduler]
strategy = "cosine"
warmup_steps = 1
total_steps = {total_steps}

[runtime]
seed = 7
device = "cpu"
log_every_n_steps = 1

[runtime.logging]
enable_stdout = false
tensorboard = "tb"

[runtime.checkpoint]
directory = "ckpt"
every_n_steps = 2
max_keep = 2

[runtime.evaluation]
every_n_steps = 2
max_batches = 2

[runtime.evaluation.best]
directory = "best"

[runtime.generation]
every_n_steps = 2
prompt_tokens = 8
max_new_tokens = 4
"#
    );
    let path = dir.join("train.toml");
    fs::write(&path, config).unwrap();
    path
}

#[test]
fn trains_evaluates_and_checkpoints() {
    let tmp = tempdir().unwrap();
    let config = TrainingConfig::load(write_config(tmp.path(), 4)).unwrap();
    let mut trainer = Trainer::new(config).unwrap();

    trainer.train().unwrap();
    assert_eq!(trainer.optimizer_step(), 4);
    assert_eq!(trainer.progress().micro_batches_drawn, 8);
    assert!(trainer.progress().best_eval_loss.is_some());

    let latest = latest_checkpoint(&tmp.path().join("ckpt")).unwrap().unwrap();
    assert_eq!(latest.manifest.progress.optimizer_step, 4);
    for file in ["model.safetensors", "optimizer.safetensors", "optimizer.json", "scheduler.json", "scaler.json"] {
        assert!(latest.directory.join(file).is_file(), "{file} missing");
    }
    assert!(fs::read_dir(tmp.path().join("best")).unwrap().count() >= 1);
    let events = fs::read_dir(tmp.path().join("tb")).unwrap().count();
    assert_eq!(events, 1);

    let summary = trainer.evaluate(Some(1)).unwrap();
    assert_eq!(summary.batches, 1);
    assert!(summary.average_loss.is_finite());
    assert!((summary.perplexity - summary.average_loss.exp()).abs() < 1e-6 * summary.perplexity);
}

#[test]
fn resumes_from_interrupted_run() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), 4);

    let mut first = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    let mut calls = 0;
    // Two optimizer steps of two micro-batches each, then stop.
    first
        .train_with_shutdown(|| {
            calls += 1;
            calls > 4
        })
        .unwrap();
    assert_eq!(first.optimizer_step(), 2);
    let loss_at_stop = first.evaluate(None).unwrap().average_loss;

    let mut resumed = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    let descriptor = resumed.resume_from_latest().unwrap().unwrap();
    assert_eq!(descriptor.manifest.progress.optimizer_step, 2);
    assert_eq!(resumed.progress().micro_batches_drawn, 4);

    let loss_after_resume = resumed.evaluate(None).unwrap().average_loss;
    assert!((loss_at_stop - loss_after_resume).abs() < 1e-5);

    resumed.train().unwrap();
    assert_eq!(resumed.optimizer_step(), 4);
    let latest = latest_checkpoint(&tmp.path().join("ckpt")).unwrap().unwrap();
    assert_eq!(latest.manifest.progress.micro_batches_drawn, 8);
}

#[test]
fn best_saves_do_not_replace_the_final_checkpoint() {
    let tmp = tempdir().unwrap();
    let config = TrainingConfig::load(write_config(tmp.path(), 3))
        .unwrap()
        .with_overrides(&[
            "runtime.checkpoint.every_n_steps=10".parse::<ConfigOverride>().unwrap(),
            "runtime.evaluation.every_n_steps=1".parse().unwrap(),
        ])
        .unwrap();
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.optimizer_step(), 3);
    assert!(fs::read_dir(tmp.path().join("best")).unwrap().count() >= 1);

    let latest = latest_checkpoint(&tmp.path().join("ckpt")).unwrap().unwrap();
    assert_eq!(latest.manifest.progress.optimizer_step, 3);

    let mut resumed =
        Trainer::new(TrainingConfig::load(tmp.path().join("train.toml")).unwrap()).unwrap();
    resumed.resume_from_latest().unwrap().unwrap();
    assert_eq!(resumed.optimizer_step(), 3);
}

#[test]
fn loss_options_reach_the_trainer() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), 1);

    let mut plain = Trainer::new(TrainingConfig::load(&config_path).unwrap()).unwrap();
    assert_eq!(plain.loss().ignore_index(), None);
    let plain_summary = plain.evaluate(None).unwrap();

    let config = TrainingConfig::load(&config_path)
        .unwrap()
        .with_overrides(&[
            "loss.label_smoothing=0.1".parse().unwrap(),
            // Newlines separate the corpus lines.
            "loss.ignore_index=10".parse().unwrap(),
        ])
        .unwrap();
    let mut trainer = Trainer::new(config).unwrap();
    assert_eq!(trainer.loss().ignore_index(), Some(10));
    assert!((trainer.loss().label_smoothing() - 0.1).abs() < 1e-6);

    let summary = trainer.evaluate(None).unwrap();
    assert!(summary.tokens < plain_summary.tokens);
    trainer.train().unwrap();
    assert_eq!(trainer.optimizer_step(), 1);
}

#[test]
fn overrides_apply_before_construction() {
    let tmp = tempdir().unwrap();
    let config = TrainingConfig::load(write_config(tmp.path(), 4))
        .unwrap()
        .with_overrides(&[
            "scheduler.total_steps=1".parse::<ConfigOverride>().unwrap(),
            "runtime.checkpoint=null".parse().unwrap(),
        ])
        .unwrap();
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.optimizer_step(), 1);
    assert!(!tmp.path().join("ckpt").exists());
    assert!(trainer.resume_from_latest().unwrap().is_none());
}

#[test]
fn rejects_corpus_shorter_than_a_window() {
    let tmp = tempdir().unwrap();
    let config = TrainingConfig::load(write_config(tmp.path(), 4))
        .unwrap()
        .with_overrides(&["data.seq_len=4096".parse().unwrap()])
        .unwrap();
    assert!(matches!(
        Trainer::new(config),
        Err(TrainingError::Initialization(_))
    ));
}
