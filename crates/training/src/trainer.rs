use std::{path::Path, sync::Arc};

use candle_core::{backprop::GradStore, Device, Var};
use model::AlrTransformer;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    checkpoint::{
        self, CheckpointDescriptor, LoadOutcome, RngSnapshot, SaveRequest,
        TrainingProgressSnapshot,
    },
    config::CheckpointConfig,
    data::{DataLoader, RandomWindowLoader, SequentialWindowLoader, TextCodec, TokenCorpus},
    device::select_device,
    logging::{Logger, LoggingSettings},
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{EvaluationMetrics, EvaluationSummary, StepAccumulator, TrainingMetrics},
    optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Offset between the data seed and the seed of the preview sampler so the
/// two streams never coincide.
const SAMPLE_SEED_OFFSET: u64 = 0x5eed;

/// Drives the optimisation loop: micro-batch accumulation, loss scaling,
/// scheduled AdamW steps, periodic evaluation, previews and checkpoints.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    codec: TextCodec,
    train_corpus: Arc<TokenCorpus>,
    validation_corpus: Option<Arc<TokenCorpus>>,
    train_loader: RandomWindowLoader,
    model: AlrTransformer,
    parameters: Vec<Var>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    scaler: GradientScaler,
    metrics: TrainingMetrics,
    logger: Logger,
    progress: TrainingProgressSnapshot,
    rng_snapshot: RngSnapshot,
    sample_rng: StdRng,
    last_checkpoint_step: Option<usize>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device(config.runtime.device);
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {err}");
        }

        let codec = match &config.tokenizer.tokenizer_json {
            Some(path) => TextCodec::from_tokenizer_file(path)?,
            None => TextCodec::Bytes,
        };
        let (train_corpus, validation_corpus) = load_corpora(&config, &codec)?;
        log::info!(
            "corpus ready: {} training token(s), {} validation token(s), vocab {}",
            train_corpus.len(),
            validation_corpus.as_ref().map_or(0, |corpus| corpus.len()),
            codec.vocab_size()
        );

        let train_loader = build_train_loader(&config, &train_corpus, &device)?;

        let model = AlrTransformer::new(config.resolve_model_config(codec.vocab_size(), &device)?)?;
        let named_parameters = model.parameters();
        let parameters = named_parameters.iter().map(|(_, var)| var.clone()).collect();
        let optimizer = TrainerOptimizer::new(
            named_parameters,
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;
        let scheduler =
            SchedulerConfig::from_training_config(&config.scheduler, config.optimizer.learning_rate)?
                .build()?;

        let ignore_index = config.loss.ignore_index.or_else(|| codec.pad_token_id());
        let loss = CrossEntropyLoss::new()
            .with_label_smoothing(config.loss.label_smoothing)?
            .with_ignore_index(ignore_index);
        log::debug!(
            "loss: label smoothing {}, ignore index {ignore_index:?}",
            config.loss.label_smoothing
        );

        let logger = Logger::new(LoggingSettings::from(&config.runtime.logging))?;
        let progress = TrainingProgressSnapshot {
            micro_batches_per_step: train_loader.micro_batches_per_step(),
            ..TrainingProgressSnapshot::default()
        };
        let seed = config.runtime.seed;

        Ok(Self {
            scaler: GradientScaler::new(config.runtime.precision),
            device,
            codec,
            train_corpus,
            validation_corpus,
            train_loader,
            model,
            parameters,
            optimizer,
            scheduler,
            loss,
            metrics: TrainingMetrics::new(),
            logger,
            progress,
            rng_snapshot: RngSnapshot { master_seed: seed },
            sample_rng: StdRng::seed_from_u64(seed.wrapping_add(SAMPLE_SEED_OFFSET)),
            last_checkpoint_step: None,
            config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &AlrTransformer {
        &self.model
    }

    pub fn codec(&self) -> &TextCodec {
        &self.codec
    }

    pub fn loss(&self) -> &CrossEntropyLoss {
        &self.loss
    }

    pub fn progress(&self) -> &TrainingProgressSnapshot {
        &self.progress
    }

    pub fn optimizer_step(&self) -> usize {
        self.progress.optimizer_step
    }

    /// Restores the newest checkpoint in the configured checkpoint directory.
    /// Returns `None` when checkpointing is disabled or nothing was saved yet.
    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(settings) = &self.config.runtime.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        self.resume_from_path(&descriptor.directory).map(Some)
    }

    pub fn resume_from_path(&mut self, directory: &Path) -> Result<CheckpointDescriptor, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        let descriptor = CheckpointDescriptor {
            directory: outcome.directory.clone(),
            manifest: outcome.manifest.clone(),
        };
        self.apply_checkpoint(outcome)?;
        log::info!(
            "resumed from {} at step {}",
            descriptor.directory.display(),
            self.progress.optimizer_step
        );
        Ok(descriptor)
    }

    /// Scores the validation corpus with dropout disabled. `max_batches`
    /// bounds the number of batches read.
    pub fn evaluate(&mut self, max_batches: Option<usize>) -> Result<EvaluationSummary, TrainingError> {
        let corpus = self
            .validation_corpus
            .clone()
            .ok_or_else(|| TrainingError::runtime("no validation data configured"))?;

        let was_training = self.model.is_training();
        self.model.set_training(false);
        let result = self.evaluate_corpus(corpus, max_batches);
        self.model.set_training(was_training);
        result
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until `scheduler.total_steps` optimizer steps have completed or
    /// `should_stop` returns `true`. A final checkpoint is written on exit
    /// when checkpointing is enabled.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let total_steps = self.config.scheduler.total_steps;
        log::info!(
            "training {} parameter(s) on {:?} from step {} to {total_steps}",
            self.model.num_parameters(),
            self.device,
            self.progress.optimizer_step
        );

        self.model.set_training(true);
        self.metrics.reset_timer();
        let mut accumulated: Option<GradStore> = None;
        let mut step_metrics = StepAccumulator::default();

        while self.progress.optimizer_step < total_steps {
            if should_stop() {
                log::info!("stop requested at step {}", self.progress.optimizer_step);
                break;
            }
            let Some(batch) = self.train_loader.next_batch()? else {
                break;
            };

            let logits = self.model.forward(&batch.inputs)?;
            let LossOutput { loss, metrics } = self.loss.compute(&logits, &batch.targets)?;
            step_metrics.accumulate(&metrics);

            let normalized = loss.affine(1.0 / batch.micro_batches_per_step as f64, 0.0)?;
            let micro_grads = self.scaler.scale(&normalized)?.backward()?;
            match accumulated.as_mut() {
                Some(existing) => self.merge_gradients(existing, micro_grads)?,
                None => accumulated = Some(micro_grads),
            }

            if !batch.is_step_boundary() {
                continue;
            }
            if let Some(mut grads) = accumulated.take() {
                self.finish_step(&mut grads, &step_metrics)?;
            }
            step_metrics.reset();
        }

        if self.progress.optimizer_step > 0
            && self.last_checkpoint_step != Some(self.progress.optimizer_step)
        {
            if let Some(settings) = self.config.runtime.checkpoint.clone() {
                self.save_resume_checkpoint(&settings)?;
            }
        }
        self.logger.flush();
        Ok(())
    }

    fn finish_step(
        &mut self,
        grads: &mut GradStore,
        step_metrics: &StepAccumulator,
    ) -> Result<(), TrainingError> {
        let loss_is_finite = step_metrics
            .average_loss()
            .is_some_and(|loss| loss.is_finite());
        let found_inf = self.scaler.unscale_gradients(grads, &self.parameters)? || !loss_is_finite;
        self.scaler.update(found_inf);
        if found_inf {
            self.optimizer.zero_grad(grads);
            if !self.scaler.is_enabled() {
                return Err(TrainingError::runtime(format!(
                    "non-finite loss or gradients at step {}",
                    self.progress.optimizer_step + 1
                )));
            }
            log::warn!(
                "skipping step {} after gradient overflow ({} skipped so far)",
                self.progress.optimizer_step + 1,
                self.scaler.skipped_steps()
            );
            return Ok(());
        }

        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        let report = self.optimizer.step(grads)?;

        let tokens = step_metrics.tokens() as u64;
        self.progress.optimizer_step += 1;
        self.progress.micro_batches_drawn = self.train_loader.micro_batches_drawn();
        self.progress.tokens_processed = self.progress.tokens_processed.saturating_add(tokens);
        let step = self.progress.optimizer_step;

        if let Some(average_loss) = step_metrics.average_loss() {
            let snapshot = self.metrics.record_step(tokens, average_loss, report.grad_norm);
            let log_every = self.config.runtime.log_every_n_steps.max(1);
            if step == 1 || step % log_every == 0 {
                self.logger
                    .log_training_step(step, lr, self.scaler.loss_scale(), &snapshot);
            }
        }

        self.maybe_evaluate(step)?;
        self.maybe_preview(step)?;
        self.maybe_checkpoint(step)?;
        self.metrics.reset_timer();
        Ok(())
    }

    fn merge_gradients(&self, accum: &mut GradStore, mut fresh: GradStore) -> Result<(), TrainingError> {
        for var in &self.parameters {
            let Some(grad) = fresh.remove(var.as_tensor()) else {
                continue;
            };
            let combined = match accum.remove(var.as_tensor()) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(var.as_tensor(), combined);
        }
        Ok(())
    }

    fn maybe_checkpoint(&mut self, step: usize) -> Result<(), TrainingError> {
        let Some(settings) = self.config.runtime.checkpoint.clone() else {
            return Ok(());
        };
        if settings.every_n_steps == 0 || step % settings.every_n_steps != 0 {
            return Ok(());
        }
        self.save_resume_checkpoint(&settings)
    }

    /// Saves into the directory `--resume` reads from. Best-model saves do
    /// not count towards `last_checkpoint_step`.
    fn save_resume_checkpoint(&mut self, settings: &CheckpointConfig) -> Result<(), TrainingError> {
        self.write_checkpoint(&settings.directory, settings.max_keep)?;
        self.last_checkpoint_step = Some(self.progress.optimizer_step);
        Ok(())
    }

    fn write_checkpoint(
        &mut self,
        base_dir: &Path,
        max_keep: Option<usize>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir,
            config: &self.config,
            model: &self.model,
            optimizer: &self.optimizer,
            scheduler: &*self.scheduler,
            scaler: &self.scaler,
            progress: self.progress.clone(),
            rng: self.rng_snapshot.clone(),
            max_keep,
        })?;
        Ok(descriptor)
    }

    fn maybe_evaluate(&mut self, step: usize) -> Result<(), TrainingError> {
        let settings = self.config.runtime.evaluation.clone();
        let Some(every) = settings.every_n_steps.filter(|every| *every > 0) else {
            return Ok(());
        };
        if step % every != 0 || self.validation_corpus.is_none() {
            return Ok(());
        }

        let summary = self.evaluate(settings.max_batches)?;
        self.logger.log_evaluation(step, &summary);
        self.progress.last_eval_loss = Some(summary.average_loss);

        let improved = self
            .progress
            .best_eval_loss
            .map_or(true, |best| summary.average_loss < best);
        if !improved {
            return Ok(());
        }
        self.progress.best_eval_loss = Some(summary.average_loss);
        if let Some(best) = settings.best {
            let descriptor = self.write_checkpoint(&best.directory, best.max_keep)?;
            log::info!(
                "new best validation loss {:.4}; saved {}",
                summary.average_loss,
                descriptor.directory.display()
            );
        }
        Ok(())
    }

    fn maybe_preview(&mut self, step: usize) -> Result<(), TrainingError> {
        let settings = &self.config.runtime.generation;
        let Some(every) = settings.every_n_steps.filter(|every| *every > 0) else {
            return Ok(());
        };
        if step % every != 0 {
            return Ok(());
        }

        let corpus = self.validation_corpus.as_ref().unwrap_or(&self.train_corpus);
        let prompt_len = settings.prompt_tokens.min(corpus.len());
        if prompt_len == 0 {
            return Ok(());
        }
        let start = self.sample_rng.gen_range(0..=corpus.len() - prompt_len);
        let prompt = corpus.tokens()[start..start + prompt_len].to_vec();

        let sampling = settings.sampling();
        let max_new_tokens = settings.max_new_tokens;
        let tokens = self
            .model
            .generate(&prompt, max_new_tokens, &sampling, &mut self.sample_rng)?;
        let prompt_text = self.codec.decode(&tokens[..prompt_len])?;
        let completion = self.codec.decode(&tokens[prompt_len..])?;
        self.logger.log_sample(step, &prompt_text, &completion);
        Ok(())
    }

    fn evaluate_corpus(
        &self,
        corpus: Arc<TokenCorpus>,
        max_batches: Option<usize>,
    ) -> Result<EvaluationSummary, TrainingError> {
        let mut loader = SequentialWindowLoader::new(
            corpus,
            self.device.clone(),
            self.config.data.seq_len,
            self.config.data.batch_size,
        )?;
        let mut metrics = EvaluationMetrics::default();
        let mut batches = 0usize;
        while max_batches.map_or(true, |limit| batches < limit) {
            let Some(batch) = loader.next_batch()? else {
                break;
            };
            batches += 1;
            let logits = self.model.forward(&batch.inputs)?;
            let output = self.loss.compute(&logits, &batch.targets)?;
            metrics.update(&output.metrics);
        }
        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no tokens"))
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            directory,
            manifest,
            optimizer_state,
            optimizer_tensors,
            scheduler_state,
            scaler_state,
            model_weights_path,
        } = outcome;

        if manifest.config_sha256 != checkpoint::fingerprint_config(&self.config)? {
            log::warn!(
                "checkpoint {} was written with a different configuration",
                directory.display()
            );
        }
        let per_step = self.train_loader.micro_batches_per_step();
        if manifest.progress.micro_batches_per_step != per_step {
            log::warn!(
                "checkpoint used {} micro-batches per step, this run uses {per_step}",
                manifest.progress.micro_batches_per_step
            );
        }

        checkpoint::apply_model_weights(&self.model, &model_weights_path)?;
        self.optimizer.load_state(optimizer_state, optimizer_tensors)?;
        self.scheduler.load_snapshot(&scheduler_state)?;
        self.scaler.load_state(scaler_state)?;

        // A fresh loader replays the seeded stream up to the saved position.
        let mut loader = build_train_loader(&self.config, &self.train_corpus, &self.device)?;
        loader.skip(manifest.progress.micro_batches_drawn);
        self.train_loader = loader;

        self.progress = manifest.progress;
        self.progress.micro_batches_per_step = per_step;
        self.rng_snapshot = manifest.rng;
        self.last_checkpoint_step = Some(self.progress.optimizer_step);
        Ok(())
    }
}

fn build_train_loader(
    config: &TrainingConfig,
    corpus: &Arc<TokenCorpus>,
    device: &Device,
) -> Result<RandomWindowLoader, TrainingError> {
    RandomWindowLoader::new(
        Arc::clone(corpus),
        device.clone(),
        config.data.seq_len,
        config.data.batch_size,
        config.data.gradient_accumulation_steps,
        config.runtime.seed,
    )
}

/// Training corpus plus the validation corpus, taken from explicit files or
/// split off the tail of the training text.
fn load_corpora(
    config: &TrainingConfig,
    codec: &TextCodec,
) -> Result<(Arc<TokenCorpus>, Option<Arc<TokenCorpus>>), TrainingError> {
    let data = &config.data;
    let corpus = TokenCorpus::from_files(&data.train_files, codec)?;

    let (train, validation) = if !data.validation_files.is_empty() {
        let validation = TokenCorpus::from_files(&data.validation_files, codec)?;
        (corpus, Some(validation))
    } else if data.validation_fraction > 0.0 {
        let (train, validation) = corpus.split(data.validation_fraction)?;
        (train, Some(validation))
    } else {
        (corpus, None)
    };

    let validation = match validation {
        Some(corpus) if corpus.window_count(data.seq_len) == 0 => {
            let message = format!(
                "validation corpus has {} token(s), fewer than one window of seq_len {}",
                corpus.len(),
                data.seq_len
            );
            if config.runtime.evaluation.every_n_steps.is_some() {
                return Err(TrainingError::initialization(message));
            }
            log::warn!("{message}; validation disabled");
            None
        }
        other => other,
    };

    Ok((Arc::new(train), validation.map(Arc::new)))
}
