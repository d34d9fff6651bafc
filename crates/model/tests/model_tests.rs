use anyhow::Result;
use candle_core::{Device, Tensor};
use relora_model::{AdapterConfig, LanguageModel, ModelConfig, ParameterRole, TinyLanguageModel};

fn config(adapter: Option<AdapterConfig>) -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_dim: 8,
        n_layers: 2,
        adapter,
        init_seed: 7,
    }
}

fn batch() -> Result<Tensor> {
    let ids: Vec<u32> = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    Ok(Tensor::from_vec(ids, (2, 5), &Device::Cpu)?)
}

fn loss_value(model: &TinyLanguageModel) -> Result<f32> {
    Ok(model.loss(&batch()?)?.to_scalar::<f32>()?)
}

#[test]
fn loss_is_finite_scalar() -> Result<()> {
    let model = TinyLanguageModel::new(config(None), &Device::Cpu)?;
    let loss = loss_value(&model)?;
    assert!(loss.is_finite());
    assert!(loss > 0.0);
    Ok(())
}

#[test]
fn identical_seeds_give_identical_models() -> Result<()> {
    let adapter = Some(AdapterConfig { rank: 2, alpha: 4.0 });
    let lhs = TinyLanguageModel::new(config(adapter), &Device::Cpu)?;
    let rhs = TinyLanguageModel::new(config(adapter), &Device::Cpu)?;
    assert_eq!(loss_value(&lhs)?, loss_value(&rhs)?);
    Ok(())
}

#[test]
fn partition_separates_adapter_from_base() -> Result<()> {
    let model = TinyLanguageModel::new(
        config(Some(AdapterConfig { rank: 2, alpha: 4.0 })),
        &Device::Cpu,
    )?;
    let params = model.parameters();
    assert!(model.has_adapter());
    assert_eq!(params.names_with_role(ParameterRole::BaseFrozen).len(), 2);
    assert_eq!(params.names_with_role(ParameterRole::Adapter).len(), 4);
    // embedding, two norms, head
    assert_eq!(params.names_with_role(ParameterRole::Trainable).len(), 4);
    assert!(params.trainable().all(|p| p.role != ParameterRole::BaseFrozen));

    let dense = TinyLanguageModel::new(config(None), &Device::Cpu)?;
    assert!(!dense.has_adapter());
    assert!(dense.parameters().with_role(ParameterRole::Adapter).next().is_none());
    Ok(())
}

#[test]
fn merge_preserves_function_and_replaces_adapter() -> Result<()> {
    let mut model = TinyLanguageModel::new(
        config(Some(AdapterConfig { rank: 2, alpha: 4.0 })),
        &Device::Cpu,
    )?;
    let before_params = model.parameters();
    let lora_b = before_params.get("layers.0.mlp.lora_B").unwrap();
    let nudged = lora_b.var.as_tensor().ones_like()?.affine(0.05, 0.0)?;
    lora_b.var.set(&nudged)?;
    let before = loss_value(&model)?;

    model.merge_and_reinit(99)?;
    let after = loss_value(&model)?;
    assert!((before - after).abs() < 1e-5, "{before} vs {after}");

    let after_params = model.parameters();
    let old_a = before_params.get("layers.0.mlp.lora_A").unwrap();
    let new_a = after_params.get("layers.0.mlp.lora_A").unwrap();
    assert_ne!(old_a.var.as_tensor().id(), new_a.var.as_tensor().id());

    let old_base = before_params.get("layers.0.mlp.weight").unwrap();
    let new_base = after_params.get("layers.0.mlp.weight").unwrap();
    assert_eq!(old_base.var.as_tensor().id(), new_base.var.as_tensor().id());
    Ok(())
}

#[test]
fn merge_is_reproducible_from_seed() -> Result<()> {
    let adapter = Some(AdapterConfig { rank: 2, alpha: 4.0 });
    let mut lhs = TinyLanguageModel::new(config(adapter), &Device::Cpu)?;
    let mut rhs = TinyLanguageModel::new(config(adapter), &Device::Cpu)?;
    lhs.merge_and_reinit(5)?;
    rhs.merge_and_reinit(5)?;
    let lhs_a = lhs.parameters().get("layers.1.mlp.lora_A").unwrap().var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let rhs_a = rhs.parameters().get("layers.1.mlp.lora_A").unwrap().var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(lhs_a, rhs_a);
    Ok(())
}

#[test]
fn short_sequences_are_rejected() -> Result<()> {
    let model = TinyLanguageModel::new(config(None), &Device::Cpu)?;
    let ids = Tensor::from_vec(vec![1u32, 2], (2, 1), &Device::Cpu)?;
    assert!(model.loss(&ids).is_err());
    Ok(())
}
