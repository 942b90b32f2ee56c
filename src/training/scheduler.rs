//! Learning-rate schedules.
//!
//! Every schedule is a multiplier on the base learning rate as a function of
//! the number of optimizer steps already taken.

use std::f64::consts::PI;

use crate::config::{SchedulerType, TrainingConfig};

/// Final learning rate of the `polynomial` schedule.
const POLYNOMIAL_LR_END: f64 = 1e-7;
/// Decay horizon of `inverse_sqrt` when there is no warmup.
const INVERSE_SQRT_TIMESCALE: f64 = 10_000.0;

#[derive(Debug, Clone)]
pub struct LrScheduler {
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrScheduler {
    pub fn new(kind: SchedulerType, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    pub fn from_config(config: &TrainingConfig, total_steps: usize) -> Self {
        Self::new(
            config.lr_scheduler_type,
            config.learning_rate,
            warmup_steps(config, total_steps),
            total_steps,
        )
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Learning rate for the update that follows `step` completed updates.
    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.factor(step)
    }

    fn factor(&self, step: usize) -> f64 {
        let step_f = step as f64;
        let warmup = self.warmup_steps as f64;
        let warming = step < self.warmup_steps;
        let warmup_factor = step_f / warmup.max(1.0);
        let decay_steps = (self.total_steps.saturating_sub(self.warmup_steps) as f64).max(1.0);
        let progress = (step_f - warmup) / decay_steps;

        match self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::ConstantWithWarmup => {
                if warming {
                    warmup_factor
                } else {
                    1.0
                }
            }
            SchedulerType::Linear => {
                if warming {
                    warmup_factor
                } else {
                    (1.0 - progress).max(0.0)
                }
            }
            SchedulerType::Cosine => {
                if warming {
                    warmup_factor
                } else {
                    (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
                }
            }
            SchedulerType::CosineWithRestarts => {
                if warming {
                    warmup_factor
                } else if progress >= 1.0 {
                    0.0
                } else {
                    // One hard restart cycle.
                    0.5 * (1.0 + (PI * (progress % 1.0)).cos())
                }
            }
            SchedulerType::Polynomial => {
                if warming {
                    warmup_factor
                } else if self.base_lr <= POLYNOMIAL_LR_END {
                    1.0
                } else if step > self.total_steps {
                    POLYNOMIAL_LR_END / self.base_lr
                } else {
                    let range = self.base_lr - POLYNOMIAL_LR_END;
                    (range * (1.0 - progress) + POLYNOMIAL_LR_END) / self.base_lr
                }
            }
            SchedulerType::InverseSqrt => {
                if warming {
                    warmup_factor
                } else {
                    let timescale = if self.warmup_steps > 0 {
                        warmup
                    } else {
                        INVERSE_SQRT_TIMESCALE
                    };
                    let shift = timescale - warmup;
                    1.0 / ((step_f + shift) / timescale).sqrt()
                }
            }
        }
    }
}

/// `warmup_steps` when set, otherwise `ceil(warmup_ratio * total_steps)`.
pub fn warmup_steps(config: &TrainingConfig, total_steps: usize) -> usize {
    if config.warmup_steps > 0 {
        config.warmup_steps
    } else {
        (config.warmup_ratio * total_steps as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_linear_with_warmup() {
        let s = LrScheduler::new(SchedulerType::Linear, 1.0, 2, 10);
        assert!(close(s.lr_at(0), 0.0));
        assert!(close(s.lr_at(1), 0.5));
        assert!(close(s.lr_at(2), 1.0));
        assert!(close(s.lr_at(6), 0.5));
        assert!(close(s.lr_at(10), 0.0));
        assert!(close(s.lr_at(12), 0.0));
    }

    #[test]
    fn test_cosine_reaches_zero() {
        let s = LrScheduler::new(SchedulerType::Cosine, 2.0, 0, 4);
        assert!(close(s.lr_at(0), 2.0));
        assert!(close(s.lr_at(2), 1.0));
        assert!(close(s.lr_at(4), 0.0));
    }

    #[test]
    fn test_cosine_with_restarts_single_cycle() {
        let s = LrScheduler::new(SchedulerType::CosineWithRestarts, 1.0, 0, 4);
        assert!(close(s.lr_at(0), 1.0));
        assert!(close(s.lr_at(2), 0.5));
        assert!(close(s.lr_at(4), 0.0));
    }

    #[test]
    fn test_constant_variants() {
        let c = LrScheduler::new(SchedulerType::Constant, 0.3, 5, 10);
        assert!(close(c.lr_at(0), 0.3));
        let w = LrScheduler::new(SchedulerType::ConstantWithWarmup, 0.3, 3, 10);
        assert!(close(w.lr_at(1), 0.1));
        assert!(close(w.lr_at(9), 0.3));
    }

    #[test]
    fn test_polynomial_decays_to_floor() {
        let s = LrScheduler::new(SchedulerType::Polynomial, 1.0, 0, 10);
        assert!(close(s.lr_at(0), 1.0));
        assert!(close(s.lr_at(10), POLYNOMIAL_LR_END));
        assert!(close(s.lr_at(11), POLYNOMIAL_LR_END));
    }

    #[test]
    fn test_inverse_sqrt_after_warmup() {
        let s = LrScheduler::new(SchedulerType::InverseSqrt, 1.0, 4, 100);
        assert!(close(s.lr_at(2), 0.5));
        assert!(close(s.lr_at(4), 1.0));
        assert!(close(s.lr_at(16), 0.5));
    }

    #[test]
    fn test_warmup_steps_take_precedence_over_ratio() {
        let config = TrainingConfig {
            warmup_ratio: 0.5,
            ..TrainingConfig::default()
        };
        assert_eq!(warmup_steps(&config, 9), 5);
        let config = TrainingConfig {
            warmup_steps: 2,
            ..config
        };
        assert_eq!(warmup_steps(&config, 9), 2);
    }
}
