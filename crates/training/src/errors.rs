use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Every variant is fatal for the whole process group; soft warnings never
/// become errors.
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("non-finite loss {loss} on rank {rank} at global step {global_step}")]
    NonFiniteLoss {
        rank: usize,
        global_step: usize,
        loss: f64,
    },

    #[error("cannot resume: {0}")]
    ResumeInconsistency(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("collective `{tag}` failed on rank {rank}: {reason}")]
    Collective {
        rank: usize,
        tag: String,
        reason: String,
    },

    #[error("process group aborted")]
    GroupAborted,

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn resume(message: impl Into<String>) -> Self {
        Self::ResumeInconsistency(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_yaml::Error> for TrainingError {
    fn from(value: serde_yaml::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
