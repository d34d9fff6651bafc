use std::collections::{HashMap, HashSet};

pub mod reset;

pub use reset::{MomentKey, MomentReset, ResetMode, ResetReport};

use candle_core::{DType, Tensor, Var};
use relora_model::ParameterSet;
use serde::{Deserialize, Serialize};

use crate::{
    config,
    distributed::ProcessGroup,
    errors::{Result, TrainingError},
};

const EPS: f64 = 1e-12;

/// Gradients keyed by parameter name.
pub type NamedGradients = HashMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.lr,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// Moment partitioning for the sharded variant: slot `i` is owned by rank
/// `i % world_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharding {
    pub rank: usize,
    pub world_size: usize,
}

impl Sharding {
    fn owns(&self, index: usize) -> bool {
        index % self.world_size == self.rank
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
    pub sharding: Option<Sharding>,
}

impl TrainerOptimizerOptions {
    pub fn from_config(
        value: &config::OptimizerConfig,
        group: &dyn ProcessGroup,
    ) -> Self {
        let sharding = match value.kind {
            config::OptimizerKind::AdamW => None,
            config::OptimizerKind::AdamWZero => Some(Sharding {
                rank: group.rank(),
                world_size: group.world_size(),
            }),
        };
        Self {
            clip_global_norm: value.clip_grad_norm,
            weight_decay_exclude: value.no_decay.clone(),
            sharding,
        }
    }
}

/// AdamW over the trainable part of a [`ParameterSet`], with moments keyed by
/// parameter name so they survive an adapter merge that swaps variables.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    slots: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
    sharding: Option<Sharding>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    /// `None` when another rank owns this slot's moments.
    moments: Option<Moments>,
    apply_weight_decay: bool,
}

#[derive(Debug, Clone)]
struct Moments {
    first: Tensor,
    second: Tensor,
}

impl Moments {
    fn zeros(param: &Var) -> Result<Self> {
        let tensor = param.as_tensor();
        Ok(Self {
            first: Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?,
            second: Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?,
        })
    }

    fn get(&self, key: MomentKey) -> &Tensor {
        match key {
            MomentKey::ExpAvg => &self.first,
            MomentKey::ExpAvgSq => &self.second,
        }
    }

    fn set(&mut self, key: MomentKey, tensor: Tensor) {
        match key {
            MomentKey::ExpAvg => self.first = tensor,
            MomentKey::ExpAvgSq => self.second = tensor,
        }
    }
}

impl TrainerOptimizer {
    pub fn new(
        params: &ParameterSet,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self> {
        let mut slots = Vec::new();
        for (index, entry) in params.trainable().enumerate() {
            let tensor = entry.var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    entry.name,
                    tensor.dtype()
                )));
            }
            let owned = options.sharding.map_or(true, |shard| shard.owns(index));
            let moments = if owned {
                Some(Moments::zeros(&entry.var)?)
            } else {
                None
            };
            slots.push(ParameterSlot {
                name: entry.name.clone(),
                param: entry.var.clone(),
                moments,
                apply_weight_decay: should_apply_weight_decay(
                    &entry.name,
                    &options.weight_decay_exclude,
                ),
            });
        }

        if slots.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one trainable parameter",
            ));
        }

        Ok(Self {
            config,
            slots,
            step: 0,
            clip_global_norm: options.clip_global_norm,
            sharding: options.sharding,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn is_sharded(&self) -> bool {
        self.sharding.is_some()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.name.clone()).collect()
    }

    /// Applies one AdamW update from `grads`, which must already be averaged
    /// across ranks. Consumed gradients are removed from the map.
    pub fn step(&mut self, grads: &mut NamedGradients, group: &dyn ProcessGroup) -> Result<()> {
        let mut processed = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(grad) = grads.remove(&slot.name) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad, norm });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm = processed
                .iter()
                .map(|item| item.norm * item.norm)
                .sum::<f64>()
                .sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0)?;
                    item.norm *= scale;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)?;

        if self.sharding.is_some() {
            self.broadcast_parameters(group)?;
        }
        Ok(())
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<()> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.slots[item.index];
            let Some(moments) = slot.moments.as_mut() else {
                continue;
            };

            let new_m = moments
                .first
                .affine(cfg.beta1, 0.0)?
                .add(&item.grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = moments
                .second
                .affine(cfg.beta2, 0.0)?
                .add(&item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.param.as_tensor().clone();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };
            slot.param.set(&decayed.sub(&update)?)?;

            moments.first = new_m;
            moments.second = new_v;
        }

        Ok(())
    }

    /// Owners publish their freshly updated parameters; every other rank
    /// contributes zeros, so the sum is the owner's value.
    fn broadcast_parameters(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        let mut buffer = Vec::new();
        for slot in &self.slots {
            let values = flatten(slot.param.as_tensor())?;
            if slot.moments.is_some() {
                buffer.extend(values.iter().map(|&v| v as f64));
            } else {
                buffer.extend(std::iter::repeat(0.0).take(values.len()));
            }
        }
        group.all_reduce_sum("optimizer.broadcast_parameters", &mut buffer)?;

        let mut offset = 0;
        for slot in &self.slots {
            let tensor = slot.param.as_tensor();
            let len = tensor.elem_count();
            let values: Vec<f32> = buffer[offset..offset + len]
                .iter()
                .map(|&v| v as f32)
                .collect();
            offset += len;
            slot.param
                .set(&Tensor::from_vec(values, tensor.dims(), tensor.device())?)?;
        }
        Ok(())
    }

    /// Points every slot at the variables of a freshly derived parameter set.
    /// Moments carry over by name; the trainable name set must not change.
    pub fn rebind(&mut self, params: &ParameterSet) -> Result<()> {
        let mut incoming: HashMap<&str, &Var> = params
            .trainable()
            .map(|entry| (entry.name.as_str(), &entry.var))
            .collect();

        for slot in &mut self.slots {
            let var = incoming.remove(slot.name.as_str()).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "parameter '{}' disappeared from the model",
                    slot.name
                ))
            })?;
            if var.as_tensor().dims() != slot.param.as_tensor().dims() {
                return Err(TrainingError::runtime(format!(
                    "parameter '{}' changed shape from {:?} to {:?}",
                    slot.name,
                    slot.param.as_tensor().dims(),
                    var.as_tensor().dims()
                )));
            }
            slot.param = var.clone();
        }

        if !incoming.is_empty() {
            let mut extra: Vec<_> = incoming.into_keys().collect();
            extra.sort_unstable();
            return Err(TrainingError::runtime(format!(
                "model gained parameters unknown to the optimizer: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    /// Full optimizer state. Collective when sharded: every rank must call it.
    pub fn consolidate(&self, group: &dyn ProcessGroup) -> Result<OptimizerState> {
        if self.sharding.is_none() {
            return self.state();
        }

        let mut buffer = Vec::new();
        for slot in &self.slots {
            let len = slot.param.as_tensor().elem_count();
            match &slot.moments {
                Some(moments) => {
                    buffer.extend(flatten(&moments.first)?.into_iter().map(f64::from));
                    buffer.extend(flatten(&moments.second)?.into_iter().map(f64::from));
                }
                None => buffer.extend(std::iter::repeat(0.0).take(2 * len)),
            }
        }
        group.all_reduce_sum("optimizer.consolidate", &mut buffer)?;

        let mut offset = 0;
        let mut parameters = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let len = slot.param.as_tensor().elem_count();
            let take = |start: usize| -> Vec<f32> {
                buffer[start..start + len].iter().map(|&v| v as f32).collect()
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: take(offset),
                second_moment: take(offset + len),
            });
            offset += 2 * len;
        }
        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Local state. Fails on a sharded optimizer; use [`Self::consolidate`].
    pub fn state(&self) -> Result<OptimizerState> {
        let mut parameters = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let moments = slot.moments.as_ref().ok_or_else(|| {
                TrainingError::runtime(format!(
                    "moments for '{}' live on another rank; consolidate first",
                    slot.name
                ))
            })?;
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: flatten(&moments.first)?,
                second_moment: flatten(&moments.second)?,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Strict restore: every slot must be present with a matching shape and
    /// the state may not name parameters the optimizer does not track.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let sharding = self.sharding;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            let expected: usize = dims.iter().product();
            if dims != saved.shape {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, saved.shape
                )));
            }
            if expected != saved.first_moment.len() || expected != saved.second_moment.len() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            if sharding.map_or(false, |shard| !shard.owns(index)) {
                slot.moments = None;
                continue;
            }
            let device = slot.param.as_tensor().device();
            slot.moments = Some(Moments {
                first: Tensor::from_vec(saved.first_moment, dims.as_slice(), device)?,
                second: Tensor::from_vec(saved.second_moment, dims.as_slice(), device)?,
            });
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort_unstable();
            return Err(TrainingError::checkpoint(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        self.step = state.step;
        Ok(())
    }

    fn slot_names(&self) -> HashSet<&str> {
        self.slots.iter().map(|slot| slot.name.as_str()).collect()
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64> {
    let value = tensor.sqr()?.sum_all()?.to_vec0::<f32>()?;
    Ok((value as f64).sqrt())
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}
