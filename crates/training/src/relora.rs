//! Merge-and-reset cycle: folds the adapter into the frozen base weights,
//! draws a fresh adapter and resets the adapter's optimizer moments.

use relora_model::{LanguageModel, ParameterRole, ParameterSet};
use tracing::{info, warn};

use crate::{
    config::RunConfig,
    distributed::ProcessGroup,
    errors::{Result, TrainingError},
    optimizer::{MomentKey, MomentReset, ResetMode, ResetReport, TrainerOptimizer},
    state::TrainingState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResetController {
    interval: Option<usize>,
    reset_optimizer: bool,
    random_pruning: f64,
    magnitude_pruning: f64,
    lr_alert_threshold: f64,
    seed: u64,
}

/// Result of one merge-and-reset.
#[derive(Debug)]
pub struct ResetOutcome {
    /// Parameter set re-derived after the merge; older sets are stale.
    pub params: ParameterSet,
    /// Moment entries touched, summed over all ranks.
    pub report: ResetReport,
}

impl ResetController {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            interval: config.relora.interval,
            reset_optimizer: config.relora.reset_optimizer,
            random_pruning: config.relora.random_pruning,
            magnitude_pruning: config.relora.magnitude_pruning,
            lr_alert_threshold: config.relora.lr_alert_threshold,
            seed: config.runtime.seed,
        }
    }

    /// A fresh launch must run a full interval of micro-steps before its
    /// first reset; a resumed launch may reset right away.
    pub fn can_reset(&self, resumed: bool, micro_steps_this_launch: usize) -> bool {
        match self.interval {
            Some(interval) => resumed || micro_steps_this_launch >= interval,
            None => false,
        }
    }

    /// Evaluated after the update that produced `update_step`.
    pub fn should_reset(&self, update_step: usize, can_reset: bool) -> bool {
        self.phase(update_step, can_reset) == Some(1)
    }

    /// True for the first update that ran with the post-reset learning rate.
    pub fn is_first_update_after_reset(&self, update_step: usize, can_reset: bool) -> bool {
        self.phase(update_step, can_reset) == Some(2)
    }

    fn phase(&self, update_step: usize, can_reset: bool) -> Option<usize> {
        let interval = self.interval?;
        if !can_reset {
            return None;
        }
        Some(update_step % interval)
    }

    pub fn moment_reset(&self, n_resets: usize) -> MomentReset {
        MomentReset {
            mode: if self.reset_optimizer {
                ResetMode::FullReset
            } else {
                ResetMode::Keep
            },
            random_pruning_ratio: self.random_pruning,
            magnitude_pruning_ratio: self.magnitude_pruning,
            seed: self.reset_seed(n_resets),
        }
    }

    /// Identical on every rank so replicated adapters stay in sync.
    pub fn reset_seed(&self, n_resets: usize) -> u64 {
        self.seed.wrapping_add(n_resets as u64)
    }

    /// Alert text when `next_lr` is above the configured threshold.
    pub fn learning_rate_alert(&self, next_lr: f64) -> Option<String> {
        (next_lr > self.lr_alert_threshold).then(|| {
            format!(
                "Optimizer lr after the reset is large. This can lead to instability. Current lr is {next_lr}"
            )
        })
    }

    /// Merges and reinitializes the adapter, rebinds the optimizer to the new
    /// variables and resets the adapter's moments. Every rank must call this
    /// at the same update step.
    pub fn reset<M>(
        &self,
        model: &mut M,
        optimizer: &mut TrainerOptimizer,
        state: &mut TrainingState,
        group: &dyn ProcessGroup,
    ) -> Result<ResetOutcome>
    where
        M: LanguageModel + ?Sized,
    {
        if !model.has_adapter() {
            return Err(TrainingError::configuration(
                "adapter reset requested for a model without an adapter",
            ));
        }

        state.n_resets += 1;
        let seed = self.reset_seed(state.n_resets);
        if group.is_main() {
            info!(
                update_step = state.update_step,
                n_resets = state.n_resets,
                lr = optimizer.learning_rate(),
                "performing adapter reset"
            );
        }

        model.merge_and_reinit(seed)?;
        let params = model.parameters();
        optimizer.rebind(&params)?;

        let adapter_names = params.names_with_role(ParameterRole::Adapter);
        if adapter_names.is_empty() {
            return Err(TrainingError::runtime(
                "model reported an adapter but exposes no adapter parameters",
            ));
        }
        let mut report = optimizer.reset_moments(
            &adapter_names,
            &MomentKey::ALL,
            &self.moment_reset(state.n_resets),
        )?;
        if optimizer.is_sharded() {
            let mut counts = [report.entries as f64, report.zeroed as f64];
            group.all_reduce_sum("relora.reset_report", &mut counts)?;
            report = ResetReport {
                entries: counts[0] as usize,
                zeroed: counts[1] as usize,
            };
        }

        if group.is_main() {
            info!(
                percent_zeroed = report.percent_zeroed(),
                entries = report.entries,
                "percent of optimizer states zeroed"
            );
        }

        Ok(ResetOutcome { params, report })
    }

    /// Logs and returns the alert for a post-reset learning rate above the
    /// threshold. Never fails the run.
    pub fn check_learning_rate(&self, next_lr: f64, rank: usize) -> Option<String> {
        let message = self.learning_rate_alert(next_lr)?;
        warn!(rank, lr = next_lr, "{message}");
        Some(message)
    }
}
