pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod errors;
pub mod evaluation;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod relora;
pub mod scheduler;
pub mod startup;
pub mod state;
pub mod trainer;

pub use config::{RunConfig, TokenCount};
pub use data::{Batch, ByteCorpus, DataSource, ShardedLoader, TokenDataset};
pub use distributed::{LocalProcessGroup, ProcessGroup, SingleProcess};
pub use errors::{Result, TrainingError};
pub use evaluation::{evaluate, EvaluationResult, TokenBudget};
pub use metrics::{JsonLinesSink, MetricsRecord, MetricsSink, RecordingSink, TracingSink};
pub use optimizer::{OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use relora::ResetController;
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use state::TrainingState;
pub use trainer::{Phase, TrainOutcome, TrainSummary, Trainer, TrainerData};
