//! Autoregressive sampling on top of [`AlrTransformer::forward`].

use std::cmp::Ordering;

use candle_core::{bail, DType, IndexOp, Result, Tensor};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};

use crate::model::AlrTransformer;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// `0.0` selects the most likely token.
    pub temperature: f32,
    pub top_k: Option<usize>,
    /// Nucleus threshold in `(0, 1)`; other values disable it.
    pub top_p: Option<f32>,
    /// Values above `1.0` dampen tokens already in the history.
    pub repetition_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            bail!("temperature must be non-negative, got {}", self.temperature);
        }
        if self.top_k == Some(0) {
            bail!("top_k must be at least 1");
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            bail!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            );
        }
        Ok(())
    }
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx)
}

/// Picks the next token id from a vector of logits over the vocabulary.
///
/// `logits` may be `(vocab,)` or `(1, vocab)`.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &Tensor,
    history: &[u32],
    config: &SamplingConfig,
    rng: &mut R,
) -> Result<u32> {
    config.validate()?;
    let logits = match logits.rank() {
        1 => logits.clone(),
        2 => logits.squeeze(0)?,
        _ => bail!("expected logits shaped (vocab,) or (1, vocab), got {:?}", logits.dims()),
    };
    let mut adjusted = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if adjusted.is_empty() {
        bail!("cannot sample from empty logits");
    }

    if config.repetition_penalty != 1.0 {
        for &token in history {
            if let Some(logit) = adjusted.get_mut(token as usize) {
                if *logit > 0.0 {
                    *logit /= config.repetition_penalty;
                } else {
                    *logit *= config.repetition_penalty;
                }
            }
        }
    }

    let greedy = argmax(&adjusted).unwrap_or(0) as u32;
    if config.temperature == 0.0 {
        return Ok(greedy);
    }

    let inv_temp = 1.0 / config.temperature;
    let max_val = adjusted.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = adjusted
        .iter()
        .map(|logit| ((logit - max_val) * inv_temp).exp())
        .collect();

    let mut ranked: Vec<usize> = (0..probs.len()).collect();
    ranked.sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    if let Some(k) = config.top_k {
        for &idx in ranked.iter().skip(k) {
            probs[idx] = 0.0;
        }
    }

    if let Some(top_p) = config.top_p.filter(|p| *p > 0.0 && *p < 1.0) {
        let total: f32 = probs.iter().sum();
        let mut cumulative = 0.0f32;
        let mut cutoff = ranked.len();
        for (rank, &idx) in ranked.iter().enumerate() {
            cumulative += probs[idx] / total;
            if cumulative >= top_p {
                cutoff = rank + 1;
                break;
            }
        }
        for &idx in ranked.iter().skip(cutoff) {
            probs[idx] = 0.0;
        }
    }

    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Ok(greedy);
    }
    match WeightedIndex::new(&probs) {
        Ok(dist) => Ok(dist.sample(rng) as u32),
        Err(_) => Ok(greedy),
    }
}

impl AlrTransformer {
    /// Extends `prompt` by `max_new_tokens` sampled tokens and returns the full
    /// sequence. The context fed to the model is truncated to `max_seq_len`
    /// when one is configured. Dropout is disabled for the duration of the call.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            bail!("generation requires a non-empty prompt");
        }
        sampling.validate()?;

        let was_training = self.is_training();
        self.set_training(false);
        let result = self.generate_inner(prompt, max_new_tokens, sampling, rng);
        self.set_training(was_training);
        result
    }

    fn generate_inner<R: Rng + ?Sized>(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        let mut tokens = prompt.to_vec();
        for _ in 0..max_new_tokens {
            let start = match self.config().max_seq_len {
                Some(max) => tokens.len().saturating_sub(max),
                None => 0,
            };
            let context = &tokens[start..];
            let input = Tensor::from_slice(context, (1, context.len()), &self.config().device)?;
            let logits = self.forward(&input)?;
            let last = logits.i((0, context.len() - 1))?;
            let next = sample_next_token(&last, context, sampling, rng)?;
            tokens.push(next);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::{rngs::StdRng, SeedableRng};

    fn logits(values: &[f32]) -> Result<Tensor> {
        Tensor::from_slice(values, values.len(), &Device::Cpu)
    }

    #[test]
    fn zero_temperature_is_greedy() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let next = sample_next_token(&logits(&[0.1, 2.0, -1.0])?, &[], &SamplingConfig::greedy(), &mut rng)?;
        assert_eq!(next, 1);
        Ok(())
    }

    #[test]
    fn top_k_one_matches_greedy() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let config = SamplingConfig {
            top_k: Some(1),
            ..SamplingConfig::default()
        };
        for _ in 0..20 {
            assert_eq!(sample_next_token(&logits(&[0.5, 0.4, 3.0, 0.1])?, &[], &config, &mut rng)?, 2);
        }
        Ok(())
    }

    #[test]
    fn top_p_keeps_only_the_nucleus() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let config = SamplingConfig {
            top_p: Some(0.5),
            ..SamplingConfig::default()
        };
        let input = logits(&[5.0, 0.0, 0.0, 0.0])?;
        for _ in 0..20 {
            assert_eq!(sample_next_token(&input, &[], &config, &mut rng)?, 0);
        }
        Ok(())
    }

    #[test]
    fn repetition_penalty_can_flip_choice() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let config = SamplingConfig {
            repetition_penalty: 4.0,
            ..SamplingConfig::greedy()
        };
        let input = logits(&[2.0, 1.0])?;
        assert_eq!(sample_next_token(&input, &[0], &config, &mut rng)?, 1);
        Ok(())
    }

    #[test]
    fn invalid_configs_are_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let input = logits(&[1.0])?;
        let bad_k = SamplingConfig {
            top_k: Some(0),
            ..SamplingConfig::default()
        };
        assert!(sample_next_token(&input, &[], &bad_k, &mut rng).is_err());
        let bad_temp = SamplingConfig {
            temperature: -1.0,
            ..SamplingConfig::default()
        };
        assert!(sample_next_token(&input, &[], &bad_temp, &mut rng).is_err());
        Ok(())
    }
}
