pub mod config;
pub mod model;
pub mod parameters;
pub mod relora;

pub use config::{AdapterConfig, ModelConfig};
pub use model::TinyLanguageModel;
pub use parameters::{LanguageModel, NamedParameter, ParameterRole, ParameterSet};
pub use relora::ReLoraLinear;
