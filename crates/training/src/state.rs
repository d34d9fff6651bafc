use serde::{Deserialize, Serialize};

/// Scalar run state owned by the training loop. Persisted as
/// `training_state.json` with every checkpoint and restored as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Micro-steps (batches) processed.
    pub global_step: usize,
    /// Optimizer updates applied.
    pub update_step: usize,
    /// Tokens processed across all ranks, including earlier launches.
    pub tokens_seen: u64,
    /// `tokens_seen` as of the moment this launch resumed.
    pub tokens_seen_before: u64,
    #[serde(rename = "n_lora_restarts")]
    pub n_resets: usize,
    /// Seconds spent in the most recent update.
    pub update_time: f64,
    #[serde(default, alias = "wandb_id")]
    pub run_id: Option<String>,
}

impl TrainingState {
    pub fn new(run_id: Option<String>) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }

    /// State to continue from after loading a checkpoint in a new launch.
    pub fn resumed(mut self) -> Self {
        self.tokens_seen_before = self.tokens_seen;
        self
    }
}
