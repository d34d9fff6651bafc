use std::{path::PathBuf, sync::Arc};

use candle_core::{DType, Tensor};
use relora_model::{LanguageModel, ParameterSet};
use tracing::{error, info, warn};

use crate::{
    checkpoint::{self, SaveRequest},
    config::RunConfig,
    data::{Batch, DataSource},
    distributed::{all_reduce_mean, ProcessGroup},
    errors::{Result, TrainingError},
    evaluation::{evaluate, EvaluationResult, TokenBudget},
    metrics::{MetricsRecord, MetricsSink, Throughput, ThroughputMeter},
    optimizer::{AdamWConfig, NamedGradients, TrainerOptimizer, TrainerOptimizerOptions},
    relora::ResetController,
    scheduler::{LRScheduler, SchedulerConfig},
    startup::{self, ResumePlan},
    state::TrainingState,
};

const LR_ALERT_TITLE: &str = "Learning rate issue";

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WarmupLoad,
    Running,
    Evaluating,
    Checkpointing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// `num_training_steps` updates were applied.
    Completed,
    /// The training data ran out first. Not a success.
    DataExhausted,
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub outcome: TrainOutcome,
    pub state: TrainingState,
    pub checkpoint: PathBuf,
    pub final_eval: EvaluationResult,
    pub test_eval: Option<EvaluationResult>,
}

/// Per-rank data sources. Every rank must hold the same set of sources.
pub struct TrainerData {
    pub train: Box<dyn DataSource>,
    pub eval: Box<dyn DataSource>,
    pub test: Option<Box<dyn DataSource>>,
}

pub struct Trainer<M: LanguageModel> {
    config: RunConfig,
    model: M,
    params: ParameterSet,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    resets: ResetController,
    state: TrainingState,
    resumed: bool,
    phase: Phase,
    group: Arc<dyn ProcessGroup>,
    data: TrainerData,
    sink: Option<Box<dyn MetricsSink>>,
    micro_steps: usize,
    throughput: ThroughputMeter,
    last_throughput: Option<Throughput>,
}

impl<M: LanguageModel> Trainer<M> {
    /// Collective. Finalizes the config for the group, prepares the save
    /// directory and restores whatever the launch resumes from. `sink` is
    /// dropped on every rank but the main one.
    pub fn new(
        config: RunConfig,
        model: M,
        data: TrainerData,
        group: Arc<dyn ProcessGroup>,
        sink: Option<Box<dyn MetricsSink>>,
    ) -> Result<Self> {
        let handle = Arc::clone(&group);
        Self::build(config, model, data, group, sink).map_err(|err| {
            error!(rank = handle.rank(), error = %err, "trainer setup failed");
            handle.abort();
            err
        })
    }

    fn build(
        mut config: RunConfig,
        model: M,
        mut data: TrainerData,
        group: Arc<dyn ProcessGroup>,
        sink: Option<Box<dyn MetricsSink>>,
    ) -> Result<Self> {
        config.validate()?;
        config.finalize(group.world_size())?;
        startup::check_adapter(&config, &model)?;
        startup::check_vocab(model.vocab_size(), data.train.vocab_size())?;
        startup::check_vocab(model.vocab_size(), data.eval.vocab_size())?;

        let launch = startup::prepare_launch(&mut config, group.as_ref())?;

        let params = model.parameters();
        let mut optimizer = TrainerOptimizer::new(
            &params,
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from_config(&config.optimizer, group.as_ref()),
        )?;
        let mut scheduler = SchedulerConfig::from_run_config(&config)?
            .build(config.optimizer.lr, config.scheduler.adjust_step)?;

        let (state, resumed) = match &launch.plan {
            ResumePlan::Fresh => (TrainingState::new(Some(launch.run_id.clone())), false),
            ResumePlan::Checkpoint(directory) => {
                let loaded = checkpoint::load_checkpoint(directory, model.device())?;
                startup::check_resume_compatible(&config, &loaded.optimizer.config)?;
                checkpoint::apply_model_weights(&params, &loaded.weights)?;
                optimizer.load_state(loaded.optimizer.optimizer)?;
                scheduler.restore(&loaded.optimizer.scheduler)?;
                let mut state = loaded.state.resumed();
                state.run_id.get_or_insert_with(|| launch.run_id.clone());
                if group.is_main() {
                    info!(
                        directory = %directory.display(),
                        global_step = state.global_step,
                        update_step = state.update_step,
                        tokens_seen = state.tokens_seen,
                        n_resets = state.n_resets,
                        lr = scheduler.learning_rate(),
                        "resumed from checkpoint"
                    );
                }
                (state, true)
            }
            ResumePlan::WarmedUp(directory) => {
                let warmed = startup::load_warmed_up(directory, model.device())?;
                startup::apply_base_weights(&params, &warmed.weights)?;
                let state = match warmed.state {
                    Some(previous) => startup::warmed_up_state(previous, launch.run_id.clone()),
                    None => TrainingState::new(Some(launch.run_id.clone())),
                };
                (state, false)
            }
        };

        if state.global_step > 0 {
            let skipped = data.train.skip_batches(state.global_step)?;
            if skipped < state.global_step {
                warn!(
                    rank = group.rank(),
                    requested = state.global_step,
                    skipped,
                    "training data ended while skipping to the resume position"
                );
            }
        }

        let mut sink = if group.is_main() { sink } else { None };
        if let (Some(sink), Some(run_id)) = (sink.as_mut(), state.run_id.as_deref()) {
            sink.set_run_id(run_id)?;
        }
        if group.is_main() {
            info!(
                world_size = group.world_size(),
                gradient_accumulation = config.gradient_accumulation(),
                total_batch_size = config.total_batch_size(),
                num_training_steps = config.num_training_steps(),
                total_params = params.numel(),
                trainable_params = params.trainable_numel(),
                remaining_updates = config.num_training_steps().saturating_sub(state.update_step),
                "trainer ready"
            );
        }

        Ok(Self {
            resets: ResetController::from_config(&config),
            config,
            model,
            params,
            optimizer,
            scheduler,
            state,
            resumed,
            phase: Phase::WarmupLoad,
            group,
            data,
            sink,
            micro_steps: 0,
            throughput: ThroughputMeter::new(),
            last_throughput: None,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.learning_rate()
    }

    /// Runs to completion. Any error aborts the whole process group so the
    /// other ranks fail instead of waiting in a collective.
    pub fn train(&mut self) -> Result<TrainSummary> {
        match self.run() {
            Ok(summary) => Ok(summary),
            Err(err) => {
                if !matches!(err, TrainingError::GroupAborted) {
                    error!(rank = self.group.rank(), error = %err, "training aborted");
                }
                self.group.abort();
                Err(err)
            }
        }
    }

    fn run(&mut self) -> Result<TrainSummary> {
        self.phase = Phase::Running;
        let accumulation = self.config.gradient_accumulation();
        let target = self.config.num_training_steps();
        let world_size = self.group.world_size();

        let mut grads = NamedGradients::new();
        let mut window_loss = 0.0;
        let mut window_batches = 0usize;
        let mut window_tokens = 0u64;
        self.throughput.restart();

        let outcome = loop {
            if self.state.update_step >= target {
                if self.group.is_main() {
                    info!(num_training_steps = target, "reached the configured number of update steps");
                }
                break TrainOutcome::Completed;
            }

            let batch = self.data.train.next_batch()?;
            let mut available = [if batch.is_some() { 1.0 } else { 0.0 }];
            self.group
                .all_reduce_sum("trainer.batch_available", &mut available)?;
            let batch = match batch {
                Some(batch) if available[0] as usize == world_size => batch,
                _ => {
                    // counters go back to the last update boundary
                    self.state.global_step -= window_batches;
                    self.micro_steps -= window_batches;
                    self.state.tokens_seen -= window_tokens;
                    warn!(
                        rank = self.group.rank(),
                        update_step = self.state.update_step,
                        discarded_micro_steps = window_batches,
                        "reached the end of the training data before num_training_steps"
                    );
                    break TrainOutcome::DataExhausted;
                }
            };

            let batch_tokens = (batch.num_tokens() * world_size) as u64;
            self.state.global_step += 1;
            self.micro_steps += 1;
            self.state.tokens_seen += batch_tokens;

            let loss = self.micro_step(&batch, &mut grads, accumulation)?;
            if self.state.global_step == 1 {
                // loss of the untouched model
                let record = MetricsRecord::from([
                    ("loss".to_string(), loss),
                    ("update_step".to_string(), 0.0),
                ]);
                self.log_metrics(&record, 0)?;
            }
            window_loss += loss;
            window_batches += 1;
            window_tokens += batch_tokens;

            if self.state.global_step % accumulation != 0 {
                continue;
            }

            let lr = self.apply_update(&mut grads)?;
            let mean_loss = window_loss / window_batches as f64;
            window_loss = 0.0;
            window_batches = 0;
            window_tokens = 0;
            self.after_update(mean_loss, lr)?;
        };

        self.finish(outcome)
    }

    /// Forward and backward for one batch; gradients are scaled by
    /// `1/accumulation` and summed into `grads` by parameter name.
    fn micro_step(
        &mut self,
        batch: &Batch,
        grads: &mut NamedGradients,
        accumulation: usize,
    ) -> Result<f64> {
        let input_ids = batch.to_tensor(self.model.device())?;
        let loss = self.model.loss(&input_ids)?;
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        if !value.is_finite() {
            return Err(TrainingError::NonFiniteLoss {
                rank: self.group.rank(),
                global_step: self.state.global_step,
                loss: value,
            });
        }

        let store = loss.affine(1.0 / accumulation as f64, 0.0)?.backward()?;
        for entry in self.params.trainable() {
            let Some(grad) = store.get(entry.var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let combined = match grads.remove(&entry.name) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            grads.insert(entry.name.clone(), combined);
        }
        Ok(value)
    }

    /// Averages gradients across ranks, applies them with the scheduled rate
    /// and advances the scheduler. Returns the rate that was used.
    fn apply_update(&mut self, grads: &mut NamedGradients) -> Result<f64> {
        if self.group.world_size() > 1 {
            self.average_gradients(grads)?;
        }

        let lr = self.scheduler.learning_rate();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(grads, self.group.as_ref())?;
        grads.clear();
        self.scheduler.step();
        self.state.update_step += 1;

        let tokens_in_update = self.state.tokens_seen - self.state.tokens_seen_before;
        self.state.tokens_seen_before = self.state.tokens_seen;
        let batches = self.config.gradient_accumulation() * self.group.world_size();
        let throughput = self.throughput.record(
            tokens_in_update,
            self.config.total_batch_size() as u64,
            batches as u64,
        );
        self.state.update_time = throughput.update_time.as_secs_f64();
        self.last_throughput = Some(throughput);
        Ok(lr)
    }

    /// Flattens every trainable gradient in parameter order, followed by one
    /// presence flag per parameter, and mean-reduces the buffer.
    fn average_gradients(&self, grads: &mut NamedGradients) -> Result<()> {
        let entries: Vec<_> = self.params.trainable().collect();
        let mut buffer = Vec::new();
        for entry in &entries {
            match grads.get(&entry.name) {
                Some(grad) => buffer.extend(
                    grad.to_dtype(DType::F32)?
                        .flatten_all()?
                        .to_vec1::<f32>()?
                        .into_iter()
                        .map(f64::from),
                ),
                None => buffer.extend(std::iter::repeat(0.0).take(entry.numel())),
            }
        }
        buffer.extend(
            entries
                .iter()
                .map(|entry| if grads.contains_key(&entry.name) { 1.0 } else { 0.0 }),
        );
        all_reduce_mean(self.group.as_ref(), "trainer.gradients", &mut buffer)?;

        let flags_start = buffer.len() - entries.len();
        let mut offset = 0;
        for (index, entry) in entries.iter().enumerate() {
            let len = entry.numel();
            if buffer[flags_start + index] > 0.0 {
                let values: Vec<f32> = buffer[offset..offset + len]
                    .iter()
                    .map(|&value| value as f32)
                    .collect();
                let tensor = entry.var.as_tensor();
                grads.insert(
                    entry.name.clone(),
                    Tensor::from_vec(values, tensor.dims(), tensor.device())?,
                );
            }
            offset += len;
        }
        Ok(())
    }

    fn after_update(&mut self, loss: f64, lr: f64) -> Result<()> {
        let update_step = self.state.update_step;
        let accumulation = self.config.gradient_accumulation();

        let can_reset = self.resets.can_reset(self.resumed, self.micro_steps);
        if self.resets.should_reset(update_step, can_reset) {
            let outcome = self.resets.reset(
                &mut self.model,
                &mut self.optimizer,
                &mut self.state,
                self.group.as_ref(),
            )?;
            self.params = outcome.params;

            let next_lr = self.scheduler.learning_rate();
            if let Some(message) = self.resets.check_learning_rate(next_lr, self.group.rank()) {
                if let Some(sink) = self.sink.as_mut() {
                    sink.alert(LR_ALERT_TITLE, &message)?;
                }
            }
        }
        if self.resets.is_first_update_after_reset(update_step, can_reset) && self.group.is_main() {
            info!(update_step, lr, "first update after adapter reset");
        }

        // a checkpoint taken at a reset step holds the merged model
        if self.micro_steps > accumulation && update_step % self.config.runtime.save_every == 0 {
            self.save()?;
        }

        if update_step % self.config.runtime.eval_every == 0 {
            let budget = TokenBudget::Bounded(self.config.runtime.eval_tokens.0);
            let result = self.run_evaluation(budget, false)?;
            if self.group.is_main() {
                info!(update_step, eval_loss = result.mean_loss, "evaluation");
            }
            let record = MetricsRecord::from([
                ("eval_loss".to_string(), result.mean_loss),
                ("eval_tokens".to_string(), result.tokens as f64),
            ]);
            self.log_metrics(&record, self.state.global_step)?;
        }

        if let Some(throughput) = self.last_throughput.take() {
            let record = MetricsRecord::from([
                ("loss".to_string(), loss),
                ("learning_rate".to_string(), lr),
                ("update_step".to_string(), update_step as f64),
                ("tokens_seen".to_string(), self.state.tokens_seen as f64),
                ("throughput_tokens_per_sec".to_string(), throughput.tokens_per_sec),
                ("throughput_examples_per_sec".to_string(), throughput.examples_per_sec),
                ("throughput_batches_per_sec".to_string(), throughput.batches_per_sec),
                ("n_resets".to_string(), self.state.n_resets as f64),
            ]);
            self.log_metrics(&record, self.state.global_step)?;
        }

        // checkpoint and evaluation time is not part of the next update
        self.throughput.restart();
        Ok(())
    }

    fn save(&mut self) -> Result<PathBuf> {
        let previous = std::mem::replace(&mut self.phase, Phase::Checkpointing);
        let directory = checkpoint::save_checkpoint(
            SaveRequest {
                save_root: &self.config.runtime.save_dir,
                params: &self.params,
                optimizer: &self.optimizer,
                scheduler: self.scheduler.as_ref(),
                state: &self.state,
                config: &self.config,
                max_keep: self.config.runtime.max_keep,
            },
            self.group.as_ref(),
        )?;
        self.phase = previous;
        Ok(directory)
    }

    fn run_evaluation(&mut self, budget: TokenBudget, test: bool) -> Result<EvaluationResult> {
        let previous = std::mem::replace(&mut self.phase, Phase::Evaluating);
        let source = match (test, self.data.test.as_mut()) {
            (true, Some(source)) => source,
            _ => &mut self.data.eval,
        };
        let result = evaluate(&self.model, source.as_mut(), budget, self.group.as_ref())?;
        self.phase = previous;
        Ok(result)
    }

    fn finish(&mut self, outcome: TrainOutcome) -> Result<TrainSummary> {
        if self.group.is_main() {
            info!(?outcome, update_step = self.state.update_step, "training finished");
        }

        let directory = checkpoint::checkpoint_dir(&self.config.runtime.save_dir, self.state.update_step);
        let mut exists = [0.0];
        if self.group.is_main() && directory.exists() {
            exists[0] = 1.0;
        }
        self.group
            .all_reduce_sum("trainer.final_checkpoint_exists", &mut exists)?;
        let checkpoint = if exists[0] > 0.0 {
            directory
        } else {
            self.save()?
        };

        let budget = TokenBudget::Bounded(self.config.runtime.final_eval_tokens.0);
        let final_eval = self.run_evaluation(budget, false)?;
        if self.group.is_main() {
            info!(
                final_eval_loss = final_eval.mean_loss,
                final_eval_tokens = final_eval.tokens,
                "final evaluation"
            );
        }
        let record = MetricsRecord::from([
            ("final_eval_loss".to_string(), final_eval.mean_loss),
            ("final_eval_tokens".to_string(), final_eval.tokens as f64),
        ]);
        self.log_metrics(&record, self.state.global_step)?;

        let test_eval = if self.data.test.is_some() {
            let result = self.run_evaluation(TokenBudget::Unbounded, true)?;
            if self.group.is_main() {
                info!(test_loss = result.mean_loss, test_tokens = result.tokens, "test evaluation");
            }
            let record = MetricsRecord::from([
                ("test_loss".to_string(), result.mean_loss),
                ("test_tokens".to_string(), result.tokens as f64),
            ]);
            self.log_metrics(&record, self.state.global_step)?;
            Some(result)
        } else {
            None
        };

        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        self.phase = Phase::Finished;

        Ok(TrainSummary {
            outcome,
            state: self.state.clone(),
            checkpoint,
            final_eval,
            test_eval,
        })
    }

    fn log_metrics(&mut self, record: &MetricsRecord, step: usize) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.log(record, step),
            None => Ok(()),
        }
    }
}
