use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{
    config::{RunConfig, SchedulerKind},
    errors::{Result, TrainingError},
};

/// Multiplier used for the first two steps of a restarted cosine cycle.
const RESTART_FLOOR: f64 = 1e-7;

/// Learning rate per update step. `learning_rate` is the rate the next
/// update will use; `step` advances past one update.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn restore(&mut self, state: &SchedulerState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: SchedulerKind,
    /// Updates taken so far.
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerConfig {
    Linear {
        warmup_steps: usize,
        total_steps: usize,
    },
    /// Cosine cycles of `cycle_length` steps, each with its own warmup.
    CyclicalCosine {
        warmup_steps: usize,
        cycle_length: usize,
        min_lr_ratio: f64,
    },
    /// One cosine decay over the run with a short re-warmup every
    /// `restart_every` steps.
    CosineRestarts {
        first_warmup_steps: usize,
        restart_warmup_steps: usize,
        restart_every: usize,
        total_steps: usize,
        min_lr_ratio: f64,
    },
}

impl SchedulerConfig {
    /// Expects a finalized config.
    pub fn from_run_config(config: &RunConfig) -> Result<Self> {
        let total_steps = config.num_training_steps();
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires num_training_steps greater than zero",
            ));
        }
        let cfg = &config.scheduler;
        let warmup_steps = cfg.warmup_steps;
        let cycle_length = cfg.cycle_length.or(config.relora.interval);

        match cfg.kind {
            SchedulerKind::Linear => Ok(SchedulerConfig::Linear {
                warmup_steps,
                total_steps,
            }),
            SchedulerKind::Cosine => {
                let cycle_length = cycle_length.unwrap_or(total_steps);
                if warmup_steps >= cycle_length {
                    return Err(TrainingError::initialization(format!(
                        "warmup_steps ({warmup_steps}) must be smaller than cycle_length ({cycle_length})"
                    )));
                }
                Ok(SchedulerConfig::CyclicalCosine {
                    warmup_steps,
                    cycle_length,
                    min_lr_ratio: cfg.min_lr_ratio,
                })
            }
            SchedulerKind::CosineRestarts => {
                let restart_every = cycle_length.ok_or_else(|| {
                    TrainingError::initialization(
                        "cosine_restarts needs cycle_length or a reset interval",
                    )
                })?;
                let restart_warmup_steps = cfg.restart_warmup_steps.ok_or_else(|| {
                    TrainingError::initialization("cosine_restarts needs restart_warmup_steps")
                })?;
                if warmup_steps >= total_steps {
                    return Err(TrainingError::initialization(format!(
                        "warmup_steps ({warmup_steps}) must be smaller than num_training_steps ({total_steps})"
                    )));
                }
                Ok(SchedulerConfig::CosineRestarts {
                    first_warmup_steps: warmup_steps,
                    restart_warmup_steps,
                    restart_every,
                    total_steps,
                    min_lr_ratio: cfg.min_lr_ratio,
                })
            }
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        match self {
            SchedulerConfig::Linear { .. } => SchedulerKind::Linear,
            SchedulerConfig::CyclicalCosine { .. } => SchedulerKind::Cosine,
            SchedulerConfig::CosineRestarts { .. } => SchedulerKind::CosineRestarts,
        }
    }

    pub fn build(self, base_lr: f64, adjust_step: usize) -> Result<Box<dyn LRScheduler>> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Box::new(LambdaScheduler {
            base_lr,
            adjust_step,
            step: 0,
            config: self,
        }))
    }

    /// Multiplier applied to the base rate at `step`.
    pub fn multiplier(&self, step: usize) -> f64 {
        match *self {
            SchedulerConfig::Linear {
                warmup_steps,
                total_steps,
            } => {
                if step < warmup_steps {
                    return step as f64 / warmup_steps.max(1) as f64;
                }
                let remaining = total_steps.saturating_sub(step) as f64;
                (remaining / total_steps.saturating_sub(warmup_steps).max(1) as f64).max(0.0)
            }
            SchedulerConfig::CyclicalCosine {
                warmup_steps,
                cycle_length,
                min_lr_ratio,
            } => {
                let cycle_step = step % cycle_length;
                if cycle_step < warmup_steps {
                    if step != cycle_step && cycle_step < 2 {
                        return RESTART_FLOOR;
                    }
                    return cycle_step as f64 / warmup_steps as f64;
                }
                let progress =
                    (cycle_step - warmup_steps) as f64 / (cycle_length - warmup_steps) as f64;
                cosine_with_floor(progress, min_lr_ratio)
            }
            SchedulerConfig::CosineRestarts {
                first_warmup_steps,
                restart_warmup_steps,
                restart_every,
                total_steps,
                min_lr_ratio,
            } => {
                if step < first_warmup_steps {
                    return step as f64 / first_warmup_steps as f64;
                }
                let decay_span = (total_steps - first_warmup_steps) as f64;
                let restart_step = step % restart_every;
                let restart_number = step / restart_every;

                if restart_step < restart_warmup_steps && step >= restart_every {
                    let end_of_warmup = restart_number * restart_every + restart_warmup_steps;
                    let progress =
                        end_of_warmup.saturating_sub(first_warmup_steps) as f64 / decay_span;
                    let peak = cosine_with_floor(progress, min_lr_ratio);
                    return restart_step as f64 / restart_warmup_steps as f64 * peak;
                }

                let progress = (step - first_warmup_steps) as f64 / decay_span;
                cosine_with_floor(progress, min_lr_ratio)
            }
        }
    }
}

fn cosine_with_floor(progress: f64, min_lr_ratio: f64) -> f64 {
    let progress = progress.clamp(0.0, 1.0);
    let decay = 0.5 * (1.0 + f64::cos(PI * progress));
    min_lr_ratio + (1.0 - min_lr_ratio) * decay
}

/// `lr(u) = base_lr * multiplier(u + adjust_step)`.
struct LambdaScheduler {
    base_lr: f64,
    adjust_step: usize,
    step: usize,
    config: SchedulerConfig,
}

impl LRScheduler for LambdaScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.config.multiplier(self.step + self.adjust_step)
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: self.config.kind(),
            step: self.step,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        if state.kind != self.config.kind() {
            return Err(TrainingError::resume(format!(
                "checkpoint scheduler is {:?} but the run is configured for {:?}",
                state.kind,
                self.config.kind()
            )));
        }
        self.step = state.step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restarts() -> SchedulerConfig {
        SchedulerConfig::CosineRestarts {
            first_warmup_steps: 10,
            restart_warmup_steps: 5,
            restart_every: 100,
            total_steps: 1_000,
            min_lr_ratio: 0.1,
        }
    }

    #[test]
    fn linear_warms_up_then_decays_to_zero() {
        let config = SchedulerConfig::Linear {
            warmup_steps: 10,
            total_steps: 110,
        };
        assert_eq!(config.multiplier(0), 0.0);
        assert_eq!(config.multiplier(5), 0.5);
        assert_eq!(config.multiplier(10), 1.0);
        assert!((config.multiplier(60) - 0.5).abs() < 1e-12);
        assert_eq!(config.multiplier(110), 0.0);
        assert_eq!(config.multiplier(500), 0.0);
    }

    #[test]
    fn cyclical_cosine_restarts_each_cycle() {
        let config = SchedulerConfig::CyclicalCosine {
            warmup_steps: 10,
            cycle_length: 100,
            min_lr_ratio: 0.1,
        };
        assert_eq!(config.multiplier(5), 0.5);
        assert_eq!(config.multiplier(10), 1.0);
        assert!((config.multiplier(99) - 0.1).abs() < 1e-3);
        assert_eq!(config.multiplier(100), RESTART_FLOOR);
        assert_eq!(config.multiplier(101), RESTART_FLOOR);
        assert_eq!(config.multiplier(105), 0.5);
    }

    #[test]
    fn cosine_restarts_rewarm_to_the_decayed_curve() {
        let config = restarts();
        assert_eq!(config.multiplier(0), 0.0);
        assert_eq!(config.multiplier(10), 1.0);

        // inside the first period there is no re-warmup
        assert!(config.multiplier(50) < 1.0);
        assert_eq!(config.multiplier(100), 0.0);
        let peak = config.multiplier(105);
        assert!((config.multiplier(102) - 0.4 * peak).abs() < 1e-12);
        // re-warmup ends on the cosine curve
        assert!(config.multiplier(104) < peak);
        assert!(config.multiplier(106) < peak);
        assert!((config.multiplier(1_000) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn snapshot_restores_position_and_checks_kind() {
        let mut scheduler = restarts().build(1e-3, 0).unwrap();
        for _ in 0..42 {
            scheduler.step();
        }
        let state = scheduler.snapshot();
        assert_eq!(state.step, 42);

        let mut resumed = restarts().build(1e-3, 0).unwrap();
        resumed.restore(&state).unwrap();
        assert_eq!(resumed.learning_rate(), scheduler.learning_rate());

        let mut linear = SchedulerConfig::Linear {
            warmup_steps: 1,
            total_steps: 10,
        }
        .build(1e-3, 0)
        .unwrap();
        assert!(linear.restore(&state).is_err());
    }

    #[test]
    fn adjust_step_shifts_the_schedule() {
        let plain = restarts().build(1.0, 0).unwrap();
        let mut shifted = restarts().build(1.0, 0).unwrap();
        let adjusted = restarts().build(1.0, 3).unwrap();
        for _ in 0..3 {
            shifted.step();
        }
        assert_eq!(adjusted.learning_rate(), shifted.learning_rate());
        assert_eq!(plain.learning_rate(), 0.0);
    }
}
