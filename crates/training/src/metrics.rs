use std::time::{Duration, Instant};

use crate::loss::LossMetrics;

const DEFAULT_SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    /// `alpha` is the weight of the newest sample.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Sums micro-batch losses until an optimizer step completes.
#[derive(Debug, Default, Clone)]
pub struct StepAccumulator {
    loss_sum: f64,
    tokens: usize,
    correct: usize,
}

impl StepAccumulator {
    pub fn accumulate(&mut self, metrics: &LossMetrics) {
        self.loss_sum += metrics.average_loss() as f64 * metrics.total_tokens() as f64;
        self.tokens += metrics.total_tokens();
        self.correct += metrics.correct_tokens();
    }

    /// Token-weighted mean loss.
    pub fn average_loss(&self) -> Option<f64> {
        (self.tokens > 0).then(|| self.loss_sum / self.tokens as f64)
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn accuracy(&self) -> Option<f64> {
        (self.tokens > 0).then(|| self.correct as f64 / self.tokens as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Smoothed training statistics across optimizer steps.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_smoothing(alpha: f64) -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(alpha),
            throughput_ema: ExponentialMovingAverage::new(alpha),
            grad_norm_ema: ExponentialMovingAverage::new(alpha),
        }
    }

    /// Restarts the step timer so a pause (evaluation, checkpointing) does not
    /// count against throughput.
    pub fn reset_timer(&mut self) {
        self.step_timer = Instant::now();
    }

    pub fn record_step(&mut self, tokens: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            tokens,
            step_tokens_per_sec,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed loss.
    pub loss: f64,
    pub step_loss: f64,
    pub tokens: u64,
    pub step_tokens_per_sec: f64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, metrics: &LossMetrics) {
        let tokens = metrics.total_tokens() as u64;
        self.loss_sum += metrics.average_loss() as f64 * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += metrics.correct_tokens() as u64;
        self.batches += 1;
    }

    /// `None` when no tokens were scored.
    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            return None;
        }
        let average_loss = self.loss_sum / self.token_count as f64;
        Some(EvaluationSummary {
            average_loss,
            perplexity: average_loss.exp(),
            accuracy: self.correct_tokens as f64 / self.token_count as f64,
            tokens: self.token_count,
            batches: self.batches,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
    pub batches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::CrossEntropyLoss;
    use candle_core::{DType, Device, Tensor};

    fn uniform_metrics(vocab: usize, tokens: usize) -> LossMetrics {
        let logits = Tensor::zeros((1, tokens, vocab), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, tokens), DType::U32, &Device::Cpu).unwrap();
        CrossEntropyLoss::new()
            .compute(&logits, &targets)
            .unwrap()
            .metrics
    }

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn step_accumulator_weights_by_tokens() {
        let mut acc = StepAccumulator::default();
        assert_eq!(acc.average_loss(), None);
        acc.accumulate(&uniform_metrics(4, 3));
        acc.accumulate(&uniform_metrics(16, 1));
        let expected = (3.0 * 4f64.ln() + 16f64.ln()) / 4.0;
        assert!((acc.average_loss().unwrap() - expected).abs() < 1e-5);
        assert_eq!(acc.tokens(), 4);
        acc.reset();
        assert_eq!(acc.tokens(), 0);
    }

    #[test]
    fn evaluation_summary_reports_perplexity() {
        let mut eval = EvaluationMetrics::default();
        eval.update(&uniform_metrics(8, 5));
        eval.update(&uniform_metrics(8, 3));
        let summary = eval.finalize().unwrap();
        assert_eq!(summary.tokens, 8);
        assert_eq!(summary.batches, 2);
        assert!((summary.perplexity - 8.0).abs() < 1e-3);
        assert!(EvaluationMetrics::default().finalize().is_none());
    }

    #[test]
    fn record_step_accumulates_tokens() {
        let mut metrics = TrainingMetrics::with_smoothing(1.0);
        metrics.record_step(10, 2.0, 1.0);
        let snapshot = metrics.record_step(5, 1.0, 0.5);
        assert_eq!(snapshot.total_tokens, 15);
        assert_eq!(snapshot.loss, 1.0);
        assert_eq!(snapshot.raw_grad_norm, 0.5);
    }
}
