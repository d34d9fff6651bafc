use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::ModelConfig,
    parameters::{LanguageModel, ParameterRole, ParameterSet},
    relora::{uniform_var, ReLoraLinear},
};

const RMS_EPS: f64 = 1e-6;

struct Block {
    norm: Var,
    projection: ReLoraLinear,
}

/// Small residual language model used as the reference [`LanguageModel`]:
/// token embedding, a stack of RMS-normed `tanh` projections with residual
/// connections, and an untied output head.
pub struct TinyLanguageModel {
    config: ModelConfig,
    device: Device,
    embedding: Var,
    blocks: Vec<Block>,
    head: Var,
}

impl TinyLanguageModel {
    /// Builds the model with weights drawn from `config.init_seed`, so every
    /// process constructing the same config starts from identical weights.
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.init_seed);

        let embedding = uniform_var(config.vocab_size, config.hidden_dim, &mut rng, device)?;
        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            let norm = Var::ones(config.hidden_dim, DType::F32, device)?;
            let projection = ReLoraLinear::new(
                format!("layers.{layer}.mlp"),
                config.hidden_dim,
                config.hidden_dim,
                config.adapter,
                &mut rng,
                device,
            )?;
            blocks.push(Block { norm, projection });
        }
        let head = uniform_var(config.vocab_size, config.hidden_dim, &mut rng, device)?;

        Ok(Self {
            config,
            device: device.clone(),
            embedding,
            blocks,
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn hidden_states(&self, inputs: &Tensor) -> Result<Tensor> {
        let mut hidden = self.embedding.as_tensor().index_select(inputs, 0)?;
        for block in &self.blocks {
            let normed = rms_norm(&hidden, block.norm.as_tensor())?;
            let update = block.projection.forward(&normed)?.tanh()?;
            hidden = hidden.add(&update)?;
        }
        Ok(hidden)
    }
}

impl LanguageModel for TinyLanguageModel {
    fn loss(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len < 2 {
            return Err(Error::Msg(format!(
                "next-token loss needs sequences of at least 2 tokens (got {seq_len})"
            )));
        }
        let inputs = input_ids
            .narrow(1, 0, seq_len - 1)?
            .contiguous()?
            .flatten_all()?;
        let targets = input_ids
            .narrow(1, 1, seq_len - 1)?
            .contiguous()?
            .flatten_all()?;

        let hidden = self.hidden_states(&inputs)?;
        let logits = hidden.matmul(&self.head.as_tensor().t()?)?;
        candle_nn::loss::cross_entropy(&logits, &targets)
    }

    fn has_adapter(&self) -> bool {
        self.blocks
            .iter()
            .any(|block| block.projection.has_adapter())
    }

    fn merge_and_reinit(&mut self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for block in &mut self.blocks {
            block.projection.merge_and_reinit(&mut rng)?;
        }
        Ok(())
    }

    fn parameters(&self) -> ParameterSet {
        let mut set = ParameterSet::new();
        set.push(
            "embed_tokens.weight",
            self.embedding.clone(),
            ParameterRole::Trainable,
        );
        for (layer, block) in self.blocks.iter().enumerate() {
            set.push(
                format!("layers.{layer}.norm.weight"),
                block.norm.clone(),
                ParameterRole::Trainable,
            );
            block.projection.collect_parameters(&mut set);
        }
        set.push("lm_head.weight", self.head.clone(), ParameterRole::Trainable);
        set
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn rms_norm(hidden: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let mean_sq = hidden.sqr()?.mean_keepdim(1)?;
    let denom = mean_sq.affine(1.0, RMS_EPS)?.sqrt()?;
    hidden.broadcast_div(&denom)?.broadcast_mul(weight)
}
