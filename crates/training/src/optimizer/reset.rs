//! Optimizer moment reset and pruning applied at every merge-and-reset cycle.
//!
//! Only the moments of the requested parameters are touched; every other
//! slot keeps its tensors unchanged. Random masks come from a generator
//! seeded per slot, so replicas on different ranks prune identically no
//! matter which rank owns the slot.

use std::collections::HashSet;

use candle_core::Tensor;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::TrainerOptimizer;
use crate::errors::{Result, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentKey {
    /// First moment estimate.
    ExpAvg,
    /// Second moment estimate.
    ExpAvgSq,
}

impl MomentKey {
    pub const ALL: [MomentKey; 2] = [MomentKey::ExpAvg, MomentKey::ExpAvgSq];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    FullReset,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentReset {
    pub mode: ResetMode,
    pub random_pruning_ratio: f64,
    pub magnitude_pruning_ratio: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub entries: usize,
    pub zeroed: usize,
}

impl ResetReport {
    pub fn percent_zeroed(&self) -> f64 {
        if self.entries == 0 {
            0.0
        } else {
            100.0 * self.zeroed as f64 / self.entries as f64
        }
    }
}

impl TrainerOptimizer {
    /// Resets the `keys` moments of the named parameters according to
    /// `reset`. Slots owned by another rank are skipped, so the report only
    /// covers local entries.
    pub fn reset_moments(
        &mut self,
        params: &[String],
        keys: &[MomentKey],
        reset: &MomentReset,
    ) -> Result<ResetReport> {
        for ratio in [reset.random_pruning_ratio, reset.magnitude_pruning_ratio] {
            if !(0.0..1.0).contains(&ratio) {
                return Err(TrainingError::runtime(format!(
                    "pruning ratio must be in [0, 1), got {ratio}"
                )));
            }
        }
        let known = self.slot_names();
        if let Some(unknown) = params.iter().find(|name| !known.contains(name.as_str())) {
            return Err(TrainingError::runtime(format!(
                "cannot reset moments of unknown parameter '{unknown}'"
            )));
        }

        let targets: HashSet<&str> = params.iter().map(String::as_str).collect();
        let mut report = ResetReport::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !targets.contains(slot.name.as_str()) {
                continue;
            }
            let Some(moments) = slot.moments.as_mut() else {
                continue;
            };
            for (key_index, &key) in keys.iter().enumerate() {
                let tensor = moments.get(key);
                let mut values = tensor.flatten_all()?.to_vec1::<f32>()?;
                match reset.mode {
                    ResetMode::FullReset => values.iter_mut().for_each(|value| *value = 0.0),
                    ResetMode::Keep => {
                        // both masks are drawn from the untouched moments
                        let threshold = if reset.magnitude_pruning_ratio > 0.0 {
                            magnitude_threshold(&values, reset.magnitude_pruning_ratio)
                        } else {
                            None
                        };
                        if reset.random_pruning_ratio > 0.0 {
                            let mut rng =
                                StdRng::seed_from_u64(slot_seed(reset.seed, index, key_index));
                            prune_random(&mut values, reset.random_pruning_ratio, &mut rng);
                        }
                        if let Some(threshold) = threshold {
                            prune_at_or_below(&mut values, threshold);
                        }
                    }
                }
                report.entries += values.len();
                report.zeroed += values.iter().filter(|value| **value == 0.0).count();
                let restored = Tensor::from_vec(values, tensor.dims(), tensor.device())?;
                moments.set(key, restored);
            }
        }
        Ok(report)
    }
}

fn slot_seed(seed: u64, slot: usize, key: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((slot as u64) << 1 | key as u64)
}

/// Keeps an entry only if a uniform draw exceeds `ratio`.
pub fn prune_random(values: &mut [f32], ratio: f64, rng: &mut StdRng) {
    for value in values.iter_mut() {
        if rng.gen::<f64>() <= ratio {
            *value = 0.0;
        }
    }
}

/// The `ratio` quantile of the magnitudes of `values`.
pub fn magnitude_threshold(values: &[f32], ratio: f64) -> Option<f32> {
    let magnitudes: Vec<f32> = values.iter().map(|value| value.abs()).collect();
    quantile(&magnitudes, ratio)
}

/// Zeroes entries whose magnitude is not above `threshold`.
fn prune_at_or_below(values: &mut [f32], threshold: f32) {
    for value in values.iter_mut() {
        if value.abs() <= threshold {
            *value = 0.0;
        }
    }
}

/// Quantile with linear interpolation between the two nearest ranks.
pub fn quantile(values: &[f32], q: f64) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = (position - lower as f64) as f32;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        distributed::SingleProcess,
        optimizer::{AdamWConfig, NamedGradients, TrainerOptimizerOptions},
    };
    use candle_core::{Device, Var};
    use relora_model::{ParameterRole, ParameterSet};

    fn warmed_optimizer(len: usize) -> TrainerOptimizer {
        let mut set = ParameterSet::new();
        let mut grads = NamedGradients::new();
        for (name, role) in [
            ("layers.0.mlp.lora_A", ParameterRole::Adapter),
            ("layers.0.mlp.lora_B", ParameterRole::Adapter),
            ("layers.0.norm.weight", ParameterRole::Trainable),
        ] {
            let zeros = Tensor::zeros(len, candle_core::DType::F32, &Device::Cpu).unwrap();
            set.push(name, Var::from_tensor(&zeros).unwrap(), role);
            let grad: Vec<f32> = (1..=len).map(|i| i as f32 / len as f32).collect();
            grads.insert(
                name.to_string(),
                Tensor::from_vec(grad, len, &Device::Cpu).unwrap(),
            );
        }
        let config = AdamWConfig {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut optimizer =
            TrainerOptimizer::new(&set, config, TrainerOptimizerOptions::default()).unwrap();
        optimizer.step(&mut grads, &SingleProcess::new()).unwrap();
        optimizer
    }

    fn adapter_names() -> Vec<String> {
        vec!["layers.0.mlp.lora_A".into(), "layers.0.mlp.lora_B".into()]
    }

    fn reset(mode: ResetMode, random: f64, magnitude: f64) -> MomentReset {
        MomentReset {
            mode,
            random_pruning_ratio: random,
            magnitude_pruning_ratio: magnitude,
            seed: 17,
        }
    }

    #[test]
    fn full_reset_zeroes_targets_and_spares_the_rest() {
        let mut optimizer = warmed_optimizer(16);
        let before = optimizer.state().unwrap();

        let report = optimizer
            .reset_moments(
                &adapter_names(),
                &MomentKey::ALL,
                &reset(ResetMode::FullReset, 0.0, 0.0),
            )
            .unwrap();
        assert_eq!(report, ResetReport { entries: 64, zeroed: 64 });
        assert_eq!(report.percent_zeroed(), 100.0);

        let after = optimizer.state().unwrap();
        for (old, new) in before.parameters.iter().zip(&after.parameters) {
            if new.name.contains("lora") {
                assert!(new.first_moment.iter().all(|v| *v == 0.0));
                assert!(new.second_moment.iter().all(|v| *v == 0.0));
            } else {
                assert_eq!(old, new);
            }
        }
    }

    #[test]
    fn keep_without_pruning_changes_nothing() {
        let mut optimizer = warmed_optimizer(8);
        let before = optimizer.state().unwrap();
        let report = optimizer
            .reset_moments(&adapter_names(), &MomentKey::ALL, &reset(ResetMode::Keep, 0.0, 0.0))
            .unwrap();
        assert_eq!(report.zeroed, 0);
        assert_eq!(optimizer.state().unwrap(), before);
    }

    #[test]
    fn magnitude_pruning_zeroes_bottom_half() {
        let mut optimizer = warmed_optimizer(100);
        let report = optimizer
            .reset_moments(
                &["layers.0.mlp.lora_A".to_string()],
                &[MomentKey::ExpAvg],
                &reset(ResetMode::Keep, 0.0, 0.5),
            )
            .unwrap();
        assert_eq!(report.entries, 100);
        assert_eq!(report.zeroed, 50);

        let state = optimizer.state().unwrap();
        let first = &state.parameters[0].first_moment;
        assert!(first[..50].iter().all(|v| *v == 0.0));
        assert!(first[50..].iter().all(|v| *v > 0.0));
        assert!(state.parameters[0].second_moment.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn random_pruning_hits_requested_fraction_reproducibly() {
        let mut lhs = warmed_optimizer(5_000);
        let mut rhs = warmed_optimizer(5_000);
        let settings = reset(ResetMode::Keep, 0.3, 0.0);
        let report = lhs
            .reset_moments(&adapter_names(), &MomentKey::ALL, &settings)
            .unwrap();
        rhs.reset_moments(&adapter_names(), &MomentKey::ALL, &settings)
            .unwrap();

        let fraction = report.zeroed as f64 / report.entries as f64;
        assert!((fraction - 0.3).abs() < 0.03, "fraction {fraction}");
        assert_eq!(lhs.state().unwrap(), rhs.state().unwrap());
    }

    #[test]
    fn random_and_magnitude_pruning_combine_independently() {
        let mut optimizer = warmed_optimizer(10_000);
        let before = optimizer.state().unwrap();
        let report = optimizer
            .reset_moments(
                &["layers.0.mlp.lora_A".to_string()],
                &[MomentKey::ExpAvg],
                &reset(ResetMode::Keep, 0.3, 0.5),
            )
            .unwrap();

        // 1 - (1 - 0.3) * (1 - 0.5)
        let fraction = report.zeroed as f64 / report.entries as f64;
        assert!((fraction - 0.65).abs() < 0.02, "fraction {fraction}");

        let original = &before.parameters[0].first_moment;
        let median = quantile(original, 0.5).unwrap();
        let pruned = &optimizer.state().unwrap().parameters[0].first_moment;
        let survivors_below_median = original
            .iter()
            .zip(pruned)
            .filter(|(old, new)| old.abs() <= median && **new != 0.0)
            .count();
        assert_eq!(survivors_below_median, 0);
    }

    #[test]
    fn magnitude_threshold_ignores_later_zeroes() {
        let values: Vec<f32> = (1..=10).map(|v| v as f32).collect();
        assert_eq!(magnitude_threshold(&values, 0.5), Some(5.5));
        let mut pruned = values.clone();
        pruned[..3].iter_mut().for_each(|value| *value = 0.0);
        prune_at_or_below(&mut pruned, 5.5);
        assert_eq!(pruned.iter().filter(|value| **value == 0.0).count(), 5);
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let mut optimizer = warmed_optimizer(4);
        let err = optimizer
            .reset_moments(
                &["missing".to_string()],
                &MomentKey::ALL,
                &reset(ResetMode::FullReset, 0.0, 0.0),
            )
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn quantile_interpolates_linearly() {
        assert_eq!(quantile(&[1.0, 2.0, 3.0, 4.0], 0.5), Some(2.5));
        assert_eq!(quantile(&[3.0, 1.0, 2.0], 0.0), Some(1.0));
        assert_eq!(quantile(&[], 0.5), None);
    }
}
