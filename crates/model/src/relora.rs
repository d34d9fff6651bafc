//! Linear projection with a mergeable low-rank adapter.
//!
//! `y = x W^T + scale * (x A^T) B^T`, with `A: (rank, in)` drawn uniformly in
//! `±1/sqrt(in)` and `B: (out, rank)` zero, so a fresh adapter leaves the
//! projection unchanged.

use candle_core::{Device, Result, Tensor, Var};
use rand::{rngs::StdRng, Rng};

use crate::{
    config::AdapterConfig,
    parameters::{ParameterRole, ParameterSet},
};

#[derive(Debug)]
struct LowRankAdapter {
    lora_a: Var,
    lora_b: Var,
    scale: f64,
}

impl LowRankAdapter {
    fn init(
        config: &AdapterConfig,
        in_features: usize,
        out_features: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let lora_a = uniform_var(config.rank, in_features, rng, device)?;
        let lora_b = Var::zeros((out_features, config.rank), candle_core::DType::F32, device)?;
        Ok(Self {
            lora_a,
            lora_b,
            scale: config.scale(),
        })
    }

    fn delta(&self) -> Result<Tensor> {
        self.lora_b
            .as_tensor()
            .matmul(self.lora_a.as_tensor())?
            .affine(self.scale, 0.0)
    }
}

#[derive(Debug)]
pub struct ReLoraLinear {
    name: String,
    in_features: usize,
    out_features: usize,
    weight: Var,
    adapter_config: Option<AdapterConfig>,
    adapter: Option<LowRankAdapter>,
}

impl ReLoraLinear {
    pub fn new(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        adapter: Option<AdapterConfig>,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let weight = uniform_var(out_features, in_features, rng, device)?;
        let adapter_state = match adapter.as_ref() {
            Some(cfg) => Some(LowRankAdapter::init(
                cfg,
                in_features,
                out_features,
                rng,
                device,
            )?),
            None => None,
        };
        Ok(Self {
            name: name.into(),
            in_features,
            out_features,
            weight,
            adapter_config: adapter,
            adapter: adapter_state,
        })
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Applies the projection to a `(tokens, in_features)` tensor.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let base = hidden.matmul(&self.weight.as_tensor().t()?)?;
        let Some(adapter) = &self.adapter else {
            return Ok(base);
        };
        let low_rank = hidden
            .matmul(&adapter.lora_a.as_tensor().t()?)?
            .matmul(&adapter.lora_b.as_tensor().t()?)?
            .affine(adapter.scale, 0.0)?;
        base.add(&low_rank)
    }

    /// Adds `scale * B A` into the base weight and replaces the adapter with
    /// freshly initialised variables.
    pub fn merge_and_reinit(&mut self, rng: &mut StdRng) -> Result<()> {
        let (Some(adapter), Some(config)) = (&self.adapter, &self.adapter_config) else {
            return Ok(());
        };
        let merged = self.weight.as_tensor().add(&adapter.delta()?)?.detach();
        self.weight.set(&merged)?;

        let device = self.weight.as_tensor().device().clone();
        self.adapter = Some(LowRankAdapter::init(
            config,
            self.in_features,
            self.out_features,
            rng,
            &device,
        )?);
        Ok(())
    }

    pub fn collect_parameters(&self, set: &mut ParameterSet) {
        match &self.adapter {
            Some(adapter) => {
                set.push(
                    format!("{}.weight", self.name),
                    self.weight.clone(),
                    ParameterRole::BaseFrozen,
                );
                set.push(
                    format!("{}.lora_A", self.name),
                    adapter.lora_a.clone(),
                    ParameterRole::Adapter,
                );
                set.push(
                    format!("{}.lora_B", self.name),
                    adapter.lora_b.clone(),
                    ParameterRole::Adapter,
                );
            }
            None => set.push(
                format!("{}.weight", self.name),
                self.weight.clone(),
                ParameterRole::Trainable,
            ),
        }
    }
}

pub(crate) fn uniform_var(
    rows: usize,
    cols: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Var> {
    let bound = 1.0 / (cols as f32).sqrt();
    let values: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Var::from_tensor(&Tensor::from_vec(values, (rows, cols), device)?)
}
