use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Token-level cross entropy with optional label smoothing and an ignored
/// target id.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn label_smoothing(&self) -> f32 {
        self.label_smoothing
    }

    pub fn ignore_index(&self) -> Option<u32> {
        self.ignore_index
    }

    /// `logits` is `(..., vocab)`, `targets` matches its leading dimensions.
    /// The returned loss tensor is the mean over counted tokens and stays
    /// attached to the graph.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        let Some((&vocab_size, token_dims)) = dims.split_last() else {
            return Err(TrainingError::runtime("logits must not be a scalar"));
        };
        if token_dims.is_empty() {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "targets {:?} do not match logits {:?}",
                targets.dims(),
                dims
            )));
        }

        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(TrainingError::runtime("no tokens available for loss computation"));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))?
            .to_dtype(DType::F32)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets.to_device(device)?.reshape(token_count)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat.to_dtype(DType::U32)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {dtype:?} for cross entropy"
                )))
            }
        };

        let valid_mask = match self.ignore_index {
            Some(ignore) => targets_flat
                .ne(&Tensor::full(ignore, token_count, device)?)?
                .to_dtype(DType::F32)?,
            None => Tensor::ones(token_count, DType::F32, device)?,
        };
        let counted = valid_mask.sum_all()?.to_vec0::<f32>()?.round() as usize;
        if counted == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let per_token = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs.mean(1)?.neg()?;
            (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
        } else {
            nll
        };

        let loss = (per_token * &valid_mask)?
            .sum_all()?
            .affine(1.0 / counted as f64, 0.0)?;
        let average_loss = loss.to_vec0::<f32>()?;

        let correct = logits_flat
            .argmax(D::Minus1)?
            .eq(&targets_flat)?
            .to_dtype(DType::F32)?;
        let correct_tokens = (correct * &valid_mask)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens: counted,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }

    pub fn perplexity(&self) -> f32 {
        self.average_loss.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1, 2], [3, 4, 5]], &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert!(approx(out.metrics.average_loss(), (8f32).ln()));
        assert_eq!(out.metrics.total_tokens(), 6);
        assert!(approx(out.metrics.perplexity(), 8.0));
    }

    #[test]
    fn confident_correct_predictions_are_cheap() {
        let logits = Tensor::new(&[[[10f32, 0.0, 0.0], [0.0, 10.0, 0.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        assert!(out.metrics.average_loss() < 1e-3);
        assert_eq!(out.metrics.correct_tokens(), 2);
        assert!(approx(out.metrics.accuracy(), 1.0));
    }

    #[test]
    fn ignored_targets_are_excluded() {
        let logits = Tensor::new(&[[[10f32, 0.0], [10.0, 0.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();
        let out = CrossEntropyLoss::new()
            .with_ignore_index(Some(1))
            .compute(&logits, &targets)
            .unwrap();
        assert_eq!(out.metrics.total_tokens(), 1);
        assert!(out.metrics.average_loss() < 1e-3);

        let all_ignored = CrossEntropyLoss::new()
            .with_ignore_index(Some(0))
            .compute(
                &logits.narrow(1, 0, 1).unwrap(),
                &targets.narrow(1, 0, 1).unwrap(),
            );
        assert!(all_ignored.is_err());
    }

    #[test]
    fn label_smoothing_raises_the_floor() {
        let logits = Tensor::new(&[[[10f32, 0.0, 0.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let sharp = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        let smoothed = CrossEntropyLoss::new()
            .with_label_smoothing(0.1)
            .unwrap()
            .compute(&logits, &targets)
            .unwrap();
        assert!(smoothed.metrics.average_loss() > sharp.metrics.average_loss());
        assert!(CrossEntropyLoss::new().with_label_smoothing(1.0).is_err());
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
    }
}
