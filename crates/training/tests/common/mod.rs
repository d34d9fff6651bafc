#![allow(dead_code)]

use std::{path::Path, sync::Arc, thread};

use candle_core::Device;
use relora_model::{LanguageModel, TinyLanguageModel};
use training::{
    DataSource, LocalProcessGroup, MetricsSink, RecordingSink, RunConfig, ShardedLoader,
    TokenDataset, TrainSummary, Trainer, TrainerData, TrainingError,
};

pub const VOCAB: usize = 16;
pub const MAX_LENGTH: usize = 8;

/// Ten updates of four two-sequence micro-batches, adapter reset every three
/// updates, checkpoint and evaluation every five.
pub fn config(save_dir: &Path) -> RunConfig {
    let yaml = format!(
        r#"
model:
  vocab_size: {VOCAB}
  hidden_dim: 8
  n_layers: 1
  adapter: {{ rank: 2, alpha: 4.0 }}
  init_seed: 11
data:
  batch_size: 2
  gradient_accumulation: 4
  max_length: {MAX_LENGTH}
optimizer:
  lr: 0.01
scheduler:
  kind: linear
  warmup_steps: 2
relora:
  interval: 3
runtime:
  save_dir: {}
  num_training_steps: 10
  seed: 42
  save_every: 5
  eval_every: 5
  eval_tokens: 32
  final_eval_tokens: 64
"#,
        save_dir.display()
    );
    RunConfig::from_yaml(&yaml).expect("test config parses")
}

/// `sequences` rows of a deterministic token stream. A shorter dataset is a
/// prefix of a longer one.
pub fn dataset(sequences: usize) -> Arc<TokenDataset> {
    let tokens: Vec<u32> = (0..sequences * MAX_LENGTH)
        .map(|index| ((index * 7 + index / 5) % VOCAB) as u32)
        .collect();
    Arc::new(
        TokenDataset::from_tokens(&tokens, MAX_LENGTH, Some(VOCAB)).expect("token dataset"),
    )
}

pub fn rank_data(
    train: &Arc<TokenDataset>,
    eval: &Arc<TokenDataset>,
    rank: usize,
    world_size: usize,
    batch_size: usize,
) -> TrainerData {
    let loader = |dataset: &Arc<TokenDataset>| -> Box<dyn DataSource> {
        Box::new(
            ShardedLoader::new(Arc::clone(dataset), rank, world_size, batch_size)
                .expect("sharded loader"),
        )
    };
    TrainerData {
        train: loader(train),
        eval: loader(eval),
        test: None,
    }
}

pub fn model(config: &RunConfig) -> TinyLanguageModel {
    TinyLanguageModel::new(config.model.clone(), &Device::Cpu).expect("model")
}

/// Model factory for `run_world`; every rank builds the same model.
pub fn tiny(config: &RunConfig) -> impl Fn(usize) -> TinyLanguageModel + Send + Sync + 'static {
    let config = config.clone();
    move |_| model(&config)
}

/// Flattened values of every parameter, in declaration order.
pub fn weights<M: LanguageModel + ?Sized>(model: &M) -> Vec<(String, Vec<f32>)> {
    model
        .parameters()
        .iter()
        .map(|entry| {
            let values = entry
                .var
                .as_tensor()
                .flatten_all()
                .and_then(|tensor| tensor.to_vec1::<f32>())
                .expect("parameter values");
            (entry.name.clone(), values)
        })
        .collect()
}

pub struct RankReport {
    pub result: Result<TrainSummary, TrainingError>,
    pub history: Vec<String>,
    pub weights: Vec<(String, Vec<f32>)>,
    pub sink: RecordingSink,
}

/// Trains one thread per rank over `train`, sharded, and collects what each
/// rank ended with.
pub fn run_world<M, F>(
    world_size: usize,
    config: &RunConfig,
    train: Arc<TokenDataset>,
    eval: Arc<TokenDataset>,
    make_model: F,
) -> Vec<RankReport>
where
    M: LanguageModel + 'static,
    F: Fn(usize) -> M + Send + Sync + 'static,
{
    let make_model = Arc::new(make_model);
    let groups = LocalProcessGroup::new_world_recording(world_size).expect("process group");
    let handles: Vec<_> = groups
        .into_iter()
        .enumerate()
        .map(|(rank, group)| {
            let config = config.clone();
            let train = Arc::clone(&train);
            let eval = Arc::clone(&eval);
            let make_model = Arc::clone(&make_model);
            thread::spawn(move || {
                let handle = group.clone();
                let sink = RecordingSink::new();
                let data = rank_data(&train, &eval, rank, world_size, config.data.batch_size);
                let trained = Trainer::new(
                    config,
                    (*make_model)(rank),
                    data,
                    Arc::new(group),
                    Some(Box::new(sink.clone()) as Box<dyn MetricsSink>),
                )
                .and_then(|mut trainer| {
                    let summary = trainer.train()?;
                    Ok((summary, weights(trainer.model())))
                });
                let (result, trained_weights) = match trained {
                    Ok((summary, values)) => (Ok(summary), values),
                    Err(err) => (Err(err), Vec::new()),
                };
                RankReport {
                    result,
                    history: handle.history(),
                    weights: trained_weights,
                    sink,
                }
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread"))
        .collect()
}

pub fn single<M, F>(config: &RunConfig, train: Arc<TokenDataset>, make_model: F) -> RankReport
where
    M: LanguageModel + 'static,
    F: Fn(usize) -> M + Send + Sync + 'static,
{
    run_world(1, config, train, dataset(100), make_model)
        .pop()
        .expect("one rank")
}
