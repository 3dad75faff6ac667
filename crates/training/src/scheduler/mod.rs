use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Produces the learning rate for each optimizer step.
pub trait LRScheduler: Send {
    /// Advances one step and returns the rate to use for it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Shape of the curve after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decay {
    Constant,
    Cosine { min_lr: f64 },
    Polynomial { min_lr: f64, power: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub decay: Decay,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        let decay = match cfg.strategy {
            config::LearningRateSchedule::Constant => Decay::Constant,
            config::LearningRateSchedule::Cosine => Decay::Cosine { min_lr: cfg.min_lr },
            config::LearningRateSchedule::Polynomial => Decay::Polynomial {
                min_lr: cfg.min_lr,
                power: cfg.power,
            },
        };
        let config = Self {
            base_lr,
            warmup_steps: cfg.warmup_steps,
            total_steps: cfg.total_steps,
            decay,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TrainingError> {
        if self.base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if self.total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if self.warmup_steps > self.total_steps {
            return Err(TrainingError::initialization(
                "scheduler warmup_steps cannot exceed total_steps",
            ));
        }
        match self.decay {
            Decay::Constant => {}
            Decay::Cosine { min_lr } | Decay::Polynomial { min_lr, .. }
                if min_lr < 0.0 || min_lr > self.base_lr =>
            {
                return Err(TrainingError::initialization(
                    "scheduler min_lr must be in [0, base_lr]",
                ));
            }
            Decay::Polynomial { power, .. } if power <= 0.0 => {
                return Err(TrainingError::initialization(
                    "polynomial scheduler power must be positive",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        self.validate()?;
        Ok(Box::new(WarmupSchedule {
            config: self,
            step: 0,
            current_lr: 0.0,
        }))
    }
}

/// Serialisable scheduler position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub decay: Decay,
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub step: usize,
    pub current_lr: f64,
}

/// Linear warmup to `base_lr`, then the configured decay until `total_steps`.
struct WarmupSchedule {
    config: SchedulerConfig,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    fn compute_lr(&self, step: usize) -> f64 {
        let SchedulerConfig {
            base_lr,
            warmup_steps,
            total_steps,
            decay,
        } = self.config;

        if warmup_steps > 0 && step < warmup_steps {
            return base_lr * (step + 1) as f64 / warmup_steps as f64;
        }

        let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
        let progress = (step.saturating_sub(warmup_steps) as f64 / span).clamp(0.0, 1.0);
        match decay {
            Decay::Constant => base_lr,
            Decay::Cosine { min_lr } => {
                min_lr + (base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
            }
            Decay::Polynomial { min_lr, power } => {
                min_lr + (base_lr - min_lr) * (1.0 - progress).powf(power)
            }
        }
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        self.current_lr = self.compute_lr(self.step);
        self.step = self.step.saturating_add(1);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            decay: self.config.decay,
            base_lr: self.config.base_lr,
            warmup_steps: self.config.warmup_steps,
            total_steps: self.config.total_steps,
            step: self.step,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.decay != self.config.decay
            || state.warmup_steps != self.config.warmup_steps
            || state.total_steps != self.config.total_steps
        {
            return Err(TrainingError::runtime(format!(
                "checkpoint scheduler ({:?}, warmup {}, total {}) differs from configured ({:?}, warmup {}, total {})",
                state.decay,
                state.warmup_steps,
                state.total_steps,
                self.config.decay,
                self.config.warmup_steps,
                self.config.total_steps
            )));
        }
        if (state.base_lr - self.config.base_lr).abs() > f64::EPSILON * self.config.base_lr.max(1.0) {
            log::warn!(
                "checkpoint base learning rate {} replaced by configured {}",
                state.base_lr,
                self.config.base_lr
            );
        }
        self.step = state.step;
        self.current_lr = if state.step == 0 {
            0.0
        } else {
            self.compute_lr(state.step - 1)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(decay: Decay, warmup: usize, total: usize) -> Box<dyn LRScheduler> {
        SchedulerConfig {
            base_lr: 1.0,
            warmup_steps: warmup,
            total_steps: total,
            decay,
        }
        .build()
        .unwrap()
    }

    fn run(scheduler: &mut dyn LRScheduler, steps: usize) -> Vec<f64> {
        (0..steps).map(|_| scheduler.step()).collect()
    }

    #[test]
    fn warmup_ramps_linearly() {
        let mut scheduler = schedule(Decay::Constant, 4, 10);
        let rates = run(scheduler.as_mut(), 6);
        assert_eq!(rates, vec![0.25, 0.5, 0.75, 1.0, 1.0, 1.0]);
        assert_eq!(scheduler.learning_rate(), 1.0);
    }

    #[test]
    fn cosine_reaches_floor_at_end() {
        let mut scheduler = schedule(Decay::Cosine { min_lr: 0.1 }, 0, 10);
        let rates = run(scheduler.as_mut(), 12);
        assert!((rates[0] - 1.0).abs() < 1e-12);
        assert!((rates[5] - 0.55).abs() < 1e-12);
        assert!((rates[10] - 0.1).abs() < 1e-12);
        assert!((rates[11] - 0.1).abs() < 1e-12);
        assert!(rates.windows(2).all(|w| w[1] <= w[0] + 1e-12));
    }

    #[test]
    fn polynomial_decay_is_linear_for_power_one() {
        let mut scheduler = schedule(
            Decay::Polynomial {
                min_lr: 0.0,
                power: 1.0,
            },
            0,
            4,
        );
        assert_eq!(run(scheduler.as_mut(), 5), vec![1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn snapshot_resumes_the_sequence() {
        let decay = Decay::Cosine { min_lr: 0.0 };
        let mut original = schedule(decay, 2, 20);
        run(original.as_mut(), 7);
        let state = original.snapshot();

        let mut resumed = schedule(decay, 2, 20);
        resumed.load_snapshot(&state).unwrap();
        assert_eq!(resumed.learning_rate(), original.learning_rate());
        assert_eq!(run(resumed.as_mut(), 5), run(original.as_mut(), 5));
    }

    #[test]
    fn snapshot_from_other_schedule_is_rejected() {
        let state = schedule(Decay::Constant, 0, 10).snapshot();
        let mut other = schedule(Decay::Cosine { min_lr: 0.0 }, 0, 10);
        assert!(other.load_snapshot(&state).is_err());
    }

    #[test]
    fn invalid_configs_fail_to_build() {
        let bad_floor = SchedulerConfig {
            base_lr: 1.0,
            warmup_steps: 0,
            total_steps: 10,
            decay: Decay::Cosine { min_lr: 2.0 },
        };
        assert!(bad_floor.build().is_err());
        let bad_warmup = SchedulerConfig {
            base_lr: 1.0,
            warmup_steps: 11,
            total_steps: 10,
            decay: Decay::Constant,
        };
        assert!(bad_warmup.build().is_err());
    }
}
