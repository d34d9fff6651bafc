use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use relora_model::ModelConfig;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Result, TrainingError};

pub const DEFAULT_EVAL_TOKENS: u64 = 10_000_000;
pub const DEFAULT_FINAL_EVAL_TOKENS: u64 = 100_000_000;
pub const DEFAULT_LR_ALERT_THRESHOLD: f64 = 1e-4;

/// Complete description of one run. Written to `training_config.yaml` when
/// the run starts and compared against the previous snapshot on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub relora: ReLoraConfig,
    pub runtime: RuntimeConfig,
}

impl RunConfig {
    /// Loads a config by extension (`yaml`/`yml`, `toml`, `json`), resolves
    /// relative paths against the file's directory and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.validate() {
            errors.push(format!("model: {err}"));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.max_length < 2 {
            errors.push("data.max_length must be at least 2".to_string());
        }
        if let Some(0) = self.data.gradient_accumulation {
            errors.push("data.gradient_accumulation must be greater than 0".to_string());
        }
        if let Some(0) = self.data.total_batch_size {
            errors.push("data.total_batch_size must be greater than 0".to_string());
        }

        if self.optimizer.lr <= 0.0 {
            errors.push("optimizer.lr must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if let Some(norm) = self.optimizer.clip_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.clip_grad_norm must be greater than 0".to_string());
            }
        }

        if !(0.0..=1.0).contains(&self.scheduler.min_lr_ratio) {
            errors.push("scheduler.min_lr_ratio must be in [0, 1]".to_string());
        }
        if let Some(0) = self.scheduler.cycle_length {
            errors.push("scheduler.cycle_length must be greater than 0".to_string());
        }
        if self.scheduler.kind == SchedulerKind::CosineRestarts {
            match self.scheduler.restart_warmup_steps {
                None => errors.push(
                    "scheduler.restart_warmup_steps is required for cosine_restarts".to_string(),
                ),
                Some(steps) => {
                    let restart_every = self.scheduler.cycle_length.or(self.relora.interval);
                    match restart_every {
                        None => errors.push(
                            "cosine_restarts needs scheduler.cycle_length or relora.interval"
                                .to_string(),
                        ),
                        Some(every) if steps >= every => errors.push(format!(
                            "scheduler.restart_warmup_steps ({steps}) must be smaller than the restart period ({every})"
                        )),
                        _ => {}
                    }
                }
            }
        }

        // resets fire on `update_step % interval == 1`, which never holds for 0 or 1
        if matches!(self.relora.interval, Some(0 | 1)) {
            errors.push("relora.interval must be at least 2".to_string());
        }
        if self.relora.interval.is_some() && self.model.adapter.is_none() {
            errors.push("relora.interval is set but model.adapter is missing".to_string());
        }
        for (label, ratio) in [
            ("relora.random_pruning", self.relora.random_pruning),
            ("relora.magnitude_pruning", self.relora.magnitude_pruning),
        ] {
            if !(0.0..1.0).contains(&ratio) {
                errors.push(format!("{label} must be in [0, 1) (got {ratio})"));
            }
        }
        if self.relora.lr_alert_threshold <= 0.0 {
            errors.push("relora.lr_alert_threshold must be greater than 0".to_string());
        }

        if self.runtime.save_dir.as_os_str().is_empty() {
            errors.push("runtime.save_dir must not be empty".to_string());
        }
        if self.runtime.save_every == 0 {
            errors.push("runtime.save_every must be greater than 0".to_string());
        }
        if self.runtime.eval_every == 0 {
            errors.push("runtime.eval_every must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.max_keep {
            errors.push("runtime.max_keep must be greater than 0".to_string());
        }
        if self.runtime.num_training_steps.is_none() && self.runtime.max_train_tokens.is_none() {
            errors.push(
                "runtime must set either num_training_steps or max_train_tokens".to_string(),
            );
        }
        if let Some(0) = self.runtime.num_training_steps {
            errors.push("runtime.num_training_steps must be greater than 0".to_string());
        }
        if self.runtime.dtype != "float32" {
            errors.push(format!(
                "runtime.dtype '{}' is not supported (only float32)",
                self.runtime.dtype
            ));
        }
        if self.runtime.warmed_up_model.is_some() && self.runtime.resume_from.is_some() {
            errors.push("runtime.warmed_up_model and runtime.resume_from are exclusive".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Derives the batch arithmetic for `world_size` ranks. Must run before a
    /// trainer is built; calling it twice with the same world size is a no-op.
    pub fn finalize(&mut self, world_size: usize) -> Result<()> {
        if world_size == 0 {
            return Err(TrainingError::configuration("world size must be greater than 0"));
        }
        let per_update = self.data.batch_size * world_size;
        if per_update == 0 {
            return Err(TrainingError::configuration("batch_size must be greater than 0"));
        }

        if self.data.gradient_accumulation.is_none() {
            let accumulation = match self.data.total_batch_size {
                Some(total) => {
                    if total % per_update != 0 {
                        return Err(TrainingError::configuration(format!(
                            "total_batch_size ({total}) must be divisible by batch_size * world_size ({per_update})"
                        )));
                    }
                    total / per_update
                }
                None => 1,
            };
            self.data.gradient_accumulation = Some(accumulation);
        }
        let accumulation = self.gradient_accumulation();
        if accumulation == 0 {
            return Err(TrainingError::configuration(
                "gradient_accumulation must be greater than 0",
            ));
        }
        let total = *self
            .data
            .total_batch_size
            .get_or_insert(accumulation * per_update);
        if accumulation * per_update != total {
            return Err(TrainingError::configuration(format!(
                "gradient_accumulation ({accumulation}) * batch_size ({}) * world_size ({world_size}) must equal total_batch_size ({total})",
                self.data.batch_size
            )));
        }

        if let Some(tokens) = self.runtime.max_train_tokens {
            let tokens_per_update = (total * self.data.max_length) as u64;
            let steps = (tokens.0 / tokens_per_update) as usize;
            if steps == 0 {
                return Err(TrainingError::configuration(format!(
                    "max_train_tokens ({}) is smaller than one update ({tokens_per_update} tokens)",
                    tokens.0
                )));
            }
            tracing::info!(
                num_training_steps = steps,
                "setting num_training_steps from max_train_tokens"
            );
            self.runtime.num_training_steps = Some(steps);
        }

        if self.scheduler.cycle_length.is_none() {
            self.scheduler.cycle_length = self.relora.interval;
        }

        Ok(())
    }

    pub fn gradient_accumulation(&self) -> usize {
        self.data.gradient_accumulation.unwrap_or(1)
    }

    pub fn total_batch_size(&self) -> usize {
        self.data
            .total_batch_size
            .unwrap_or(self.data.batch_size * self.gradient_accumulation())
    }

    pub fn num_training_steps(&self) -> usize {
        self.runtime.num_training_steps.unwrap_or(0)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Text file tokenized byte-wise by the CLI. Library callers pass their
    /// own data sources and may leave this unset.
    #[serde(default)]
    pub train_data: Option<PathBuf>,
    #[serde(default)]
    pub eval_data: Option<PathBuf>,
    /// Held-out split evaluated once, without a token budget, after training.
    #[serde(default)]
    pub test_data: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub total_batch_size: Option<usize>,
    #[serde(default)]
    pub gradient_accumulation: Option<usize>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.train_data.as_mut(),
            self.eval_data.as_mut(),
            self.test_data.as_mut(),
        ]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    AdamW,
    /// AdamW with moments sharded across ranks.
    AdamWZero,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::AdamW
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub kind: OptimizerKind,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_clip_grad_norm")]
    pub clip_grad_norm: Option<f64>,
    /// Parameters whose name contains any of these substrings skip weight
    /// decay, e.g. `["norm"]`.
    #[serde(default)]
    pub no_decay: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::default(),
            lr: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
            clip_grad_norm: default_clip_grad_norm(),
            no_decay: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Linear,
    Cosine,
    CosineRestarts,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        Self::CosineRestarts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Steps per cosine cycle, or between restarts. Defaults to the reset
    /// interval so resets coincide with restarts.
    #[serde(default)]
    pub cycle_length: Option<usize>,
    #[serde(default)]
    pub restart_warmup_steps: Option<usize>,
    #[serde(default = "default_min_lr_ratio")]
    pub min_lr_ratio: f64,
    /// Offset added to the update step before evaluating the schedule.
    #[serde(default)]
    pub adjust_step: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::default(),
            warmup_steps: default_warmup_steps(),
            cycle_length: None,
            restart_warmup_steps: None,
            min_lr_ratio: default_min_lr_ratio(),
            adjust_step: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReLoraConfig {
    /// Update steps between merge-and-reset cycles. `None` disables resets.
    #[serde(default)]
    pub interval: Option<usize>,
    /// Zero the adapter's optimizer moments on every reset.
    #[serde(default = "default_true")]
    pub reset_optimizer: bool,
    #[serde(default)]
    pub random_pruning: f64,
    #[serde(default)]
    pub magnitude_pruning: f64,
    #[serde(default = "default_lr_alert_threshold")]
    pub lr_alert_threshold: f64,
}

impl Default for ReLoraConfig {
    fn default() -> Self {
        Self {
            interval: None,
            reset_optimizer: true,
            random_pruning: 0.0,
            magnitude_pruning: 0.0,
            lr_alert_threshold: default_lr_alert_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub save_dir: PathBuf,
    #[serde(default)]
    pub num_training_steps: Option<usize>,
    #[serde(default)]
    pub max_train_tokens: Option<TokenCount>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default)]
    pub autoresume: bool,
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    /// Checkpoint whose weights and counters seed this run. Its optimizer
    /// state is not loaded.
    #[serde(default)]
    pub warmed_up_model: Option<PathBuf>,
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    #[serde(default = "default_eval_tokens")]
    pub eval_tokens: TokenCount,
    #[serde(default = "default_final_eval_tokens")]
    pub final_eval_tokens: TokenCount,
    #[serde(default)]
    pub max_keep: Option<usize>,
    /// JSON-lines metrics file written by the main rank.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.save_dir, base);
        for path in [
            self.resume_from.as_mut(),
            self.warmed_up_model.as_mut(),
            self.metrics_path.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

/// Token amount accepted either as an integer or with a `K`/`M`/`B` suffix
/// (`"100M"`, `"1.5B"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenCount(pub u64);

impl FromStr for TokenCount {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().replace('_', "");
        let (number, multiplier) = match trimmed.chars().last() {
            Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1e3),
            Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1e6),
            Some('B') | Some('b') => (&trimmed[..trimmed.len() - 1], 1e9),
            _ => (trimmed.as_str(), 1.0),
        };
        if multiplier == 1.0 {
            if let Ok(value) = number.parse::<u64>() {
                return Ok(TokenCount(value));
            }
        }
        let value: f64 = number.parse().map_err(|_| {
            TrainingError::ConfigFormat(format!("invalid token count '{s}'"))
        })?;
        if !value.is_finite() || value < 0.0 {
            return Err(TrainingError::ConfigFormat(format!(
                "invalid token count '{s}'"
            )));
        }
        Ok(TokenCount((value * multiplier).round() as u64))
    }
}

impl fmt::Display for TokenCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for TokenCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(value) => Ok(TokenCount(value)),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    8
}

fn default_max_length() -> usize {
    256
}

fn default_lr() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_clip_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_warmup_steps() -> usize {
    1_000
}

fn default_min_lr_ratio() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_lr_alert_threshold() -> f64 {
    DEFAULT_LR_ALERT_THRESHOLD
}

fn default_seed() -> u64 {
    0
}

fn default_dtype() -> String {
    "float32".to_string()
}

fn default_save_every() -> usize {
    10_000
}

fn default_eval_every() -> usize {
    5_000
}

fn default_eval_tokens() -> TokenCount {
    TokenCount(DEFAULT_EVAL_TOKENS)
}

fn default_final_eval_tokens() -> TokenCount {
    TokenCount(DEFAULT_FINAL_EVAL_TOKENS)
}
