use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Shape of the reference language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    /// Low-rank adapter attached to every block projection. `None` trains
    /// the full projection weights instead.
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
}

/// Low-rank adapter hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl AdapterConfig {
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if let Some(adapter) = &self.adapter {
            if adapter.rank == 0 {
                return Err(Error::Msg("adapter rank must be greater than zero".into()));
            }
            if adapter.rank > self.hidden_dim {
                return Err(Error::Msg(format!(
                    "adapter rank ({}) cannot exceed hidden_dim ({})",
                    adapter.rank, self.hidden_dim
                )));
            }
            if !(adapter.alpha > 0.0) {
                return Err(Error::Msg("adapter alpha must be positive".into()));
            }
        }
        Ok(())
    }
}

fn default_alpha() -> f64 {
    32.0
}

fn default_init_seed() -> u64 {
    0
}
