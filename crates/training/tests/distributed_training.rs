mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use candle_core::{Device, Tensor};
use relora_model::{LanguageModel, ParameterSet, TinyLanguageModel};
use tempfile::tempdir;
use training::{checkpoint::checkpoint_dir, config::OptimizerKind, TrainOutcome, TrainingError};

/// Returns a NaN loss from the `poison_at`-th call onwards on one rank.
struct PoisonedModel {
    inner: TinyLanguageModel,
    calls: AtomicUsize,
    poison_at: Option<usize>,
}

impl LanguageModel for PoisonedModel {
    fn loss(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let loss = self.inner.loss(input_ids)?;
        match self.poison_at {
            Some(at) if call >= at => loss.affine(f64::NAN, 0.0),
            _ => Ok(loss),
        }
    }

    fn has_adapter(&self) -> bool {
        self.inner.has_adapter()
    }

    fn merge_and_reinit(&mut self, seed: u64) -> candle_core::Result<()> {
        self.inner.merge_and_reinit(seed)
    }

    fn parameters(&self) -> ParameterSet {
        self.inner.parameters()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }
}

fn max_abs_diff(lhs: &[(String, Vec<f32>)], rhs: &[(String, Vec<f32>)]) -> f32 {
    assert_eq!(lhs.len(), rhs.len());
    lhs.iter()
        .zip(rhs)
        .flat_map(|((lhs_name, lhs), (rhs_name, rhs))| {
            assert_eq!(lhs_name, rhs_name);
            lhs.iter().zip(rhs).map(|(a, b)| (a - b).abs())
        })
        .fold(0.0, f32::max)
}

#[test]
fn two_ranks_stay_in_lockstep() -> Result<()> {
    let dir = tempdir()?;
    let save_dir = dir.path().join("run");
    let config = common::config(&save_dir);

    let reports = common::run_world(
        2,
        &config,
        common::dataset(200),
        common::dataset(100),
        common::tiny(&config),
    );
    let [rank0, rank1] = <[common::RankReport; 2]>::try_from(reports)
        .map_err(|_| anyhow::anyhow!("expected two ranks"))?;

    assert!(!rank0.history.is_empty());
    assert_eq!(rank0.history, rank1.history);
    assert_eq!(rank0.weights, rank1.weights);

    for report in [&rank0, &rank1] {
        let summary = report.result.as_ref().map_err(|err| anyhow::anyhow!("{err}"))?;
        assert_eq!(summary.outcome, TrainOutcome::Completed);
        assert_eq!(summary.state.update_step, 10);
        assert_eq!(summary.state.global_step, 40);
        assert_eq!(summary.state.tokens_seen, 1280);
        assert_eq!(summary.state.n_resets, 4);
        assert_eq!(summary.checkpoint, checkpoint_dir(&save_dir, 10));
    }

    // only the main rank reports metrics
    assert!(!rank0.sink.snapshot().logs.is_empty());
    assert!(rank1.sink.snapshot().logs.is_empty());
    Ok(())
}

#[test]
fn sharded_optimizer_tracks_replicated_optimizer() -> Result<()> {
    let dir = tempdir()?;
    let replicated_config = common::config(&dir.path().join("replicated"));
    let mut sharded_config = common::config(&dir.path().join("sharded"));
    sharded_config.optimizer.kind = OptimizerKind::AdamWZero;

    let replicated = common::run_world(
        2,
        &replicated_config,
        common::dataset(200),
        common::dataset(100),
        common::tiny(&replicated_config),
    );
    let sharded = common::run_world(
        2,
        &sharded_config,
        common::dataset(200),
        common::dataset(100),
        common::tiny(&sharded_config),
    );

    for report in replicated.iter().chain(&sharded) {
        assert!(report.result.is_ok(), "{:?}", report.result.as_ref().err());
    }
    assert_eq!(sharded[0].history, sharded[1].history);
    assert_eq!(sharded[0].weights, sharded[1].weights);
    assert!(max_abs_diff(&replicated[0].weights, &sharded[0].weights) < 1e-4);
    Ok(())
}

#[test]
fn non_finite_loss_on_one_rank_aborts_the_group() -> Result<()> {
    let dir = tempdir()?;
    let config = common::config(&dir.path().join("run"));
    let model_config = config.clone();

    let reports = common::run_world(
        2,
        &config,
        common::dataset(200),
        common::dataset(100),
        move |rank| PoisonedModel {
            inner: common::model(&model_config),
            calls: AtomicUsize::new(0),
            poison_at: (rank == 1).then_some(3),
        },
    );

    assert!(matches!(
        reports[1].result,
        Err(TrainingError::NonFiniteLoss {
            rank: 1,
            global_step: 3,
            ..
        })
    ));
    assert!(matches!(reports[0].result, Err(TrainingError::GroupAborted)));
    Ok(())
}

#[test]
fn uneven_shards_stop_together() -> Result<()> {
    let dir = tempdir()?;
    let save_dir = dir.path().join("run");
    let config = common::config(&save_dir);

    // 43 sequences: eleven batches on rank 0, ten on rank 1; the last two
    // micro-steps of the third window are dropped
    let reports = common::run_world(
        2,
        &config,
        common::dataset(43),
        common::dataset(100),
        common::tiny(&config),
    );

    assert_eq!(reports[0].history, reports[1].history);
    for report in &reports {
        let summary = report.result.as_ref().map_err(|err| anyhow::anyhow!("{err}"))?;
        assert_eq!(summary.outcome, TrainOutcome::DataExhausted);
        assert_eq!(summary.state.global_step, 8);
        assert_eq!(summary.state.tokens_seen, 256);
        assert_eq!(summary.state.update_step, 2);
        assert_eq!(summary.checkpoint, checkpoint_dir(&save_dir, 2));
    }
    Ok(())
}
