use relora_model::LanguageModel;

use crate::{
    data::DataSource,
    distributed::ProcessGroup,
    errors::{Result, TrainingError},
};

/// How many tokens (summed over all ranks) an evaluation may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBudget {
    Bounded(u64),
    /// Consume the whole source.
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub mean_loss: f64,
    pub tokens: u64,
}

/// Token-weighted mean loss over `source`, aggregated across the group.
///
/// Every rank runs the same number of iterations: the count is derived from
/// the first batch's aggregate token count, and each iteration reduces a
/// "batch available" flag so a rank with a shorter shard stops everyone.
pub fn evaluate(
    model: &dyn LanguageModel,
    source: &mut dyn DataSource,
    budget: TokenBudget,
    group: &dyn ProcessGroup,
) -> Result<EvaluationResult> {
    source.rewind()?;
    let mut pending = source.next_batch()?;

    let mut first_tokens = [pending.as_ref().map_or(0.0, |batch| batch.num_tokens() as f64)];
    group.all_reduce_sum("evaluation.first_batch_tokens", &mut first_tokens)?;
    let tokens_per_iteration = first_tokens[0] as u64;
    if tokens_per_iteration == 0 {
        return Err(TrainingError::runtime(
            "evaluation data source produced no batches",
        ));
    }

    let iterations = match budget {
        TokenBudget::Bounded(limit) => (limit / tokens_per_iteration).max(1),
        TokenBudget::Unbounded => u64::MAX,
    };

    let mut loss_sum = 0.0f64;
    let mut token_sum = 0u64;
    for iteration in 0..iterations {
        let batch = if iteration == 0 {
            pending.take()
        } else {
            source.next_batch()?
        };

        let mut available = [if batch.is_some() { 1.0 } else { 0.0 }];
        group.all_reduce_sum("evaluation.batch_available", &mut available)?;
        if (available[0] as usize) < group.world_size() {
            break;
        }
        let Some(batch) = batch else {
            break;
        };

        let input_ids = batch.to_tensor(model.device())?;
        let loss = model.loss(&input_ids)?.detach().to_scalar::<f32>()? as f64;
        let tokens = batch.num_tokens() as u64;
        loss_sum += loss * tokens as f64;
        token_sum += tokens;
    }

    let mut totals = [loss_sum, token_sum as f64];
    group.all_reduce_sum("evaluation.totals", &mut totals)?;
    let tokens = totals[1] as u64;
    let mean_loss = totals[0] / totals[1];
    if !mean_loss.is_finite() {
        return Err(TrainingError::runtime(format!(
            "evaluation loss is not finite ({mean_loss}) on rank {}",
            group.rank()
        )));
    }

    Ok(EvaluationResult { mean_loss, tokens })
}
