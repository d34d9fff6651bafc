use std::{path::PathBuf, process::ExitCode, str::FromStr, sync::Arc, thread};

use anyhow::{anyhow, Context};
use candle_core::Device;
use clap::Parser;
use relora_model::TinyLanguageModel;
use serde_json::{Number, Value};
use tracing::warn;
use training::{
    logging, ByteCorpus, DataSource, JsonLinesSink, LocalProcessGroup, MetricsSink,
    ProcessGroup, RunConfig, ShardedLoader, SingleProcess, TokenDataset, TracingSink,
    TrainOutcome, Trainer, TrainerData, TrainingError,
};

fn main() -> ExitCode {
    match run() {
        Ok(TrainOutcome::Completed) => ExitCode::SUCCESS,
        Ok(TrainOutcome::DataExhausted) => ExitCode::from(2),
        Err(err) => {
            eprintln!("training failed: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "ReLoRA pretraining launcher", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to run config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value_t = 1, help = "Number of ranks to run in this process")]
    world_size: usize,

    #[arg(long, default_value = "info", help = "Log filter used when RUST_LOG is unset")]
    log: String,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

struct Corpora {
    train: Arc<TokenDataset>,
    eval: Arc<TokenDataset>,
    test: Option<Arc<TokenDataset>>,
}

fn run() -> anyhow::Result<TrainOutcome> {
    let args = Args::parse();
    logging::init(&args.log)?;

    let mut config = RunConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let corpora = Arc::new(load_corpora(&config)?);
    let groups: Vec<Arc<dyn ProcessGroup>> = if args.world_size == 1 {
        vec![Arc::new(SingleProcess::new())]
    } else {
        LocalProcessGroup::new_world(args.world_size)?
            .into_iter()
            .map(|group| Arc::new(group) as Arc<dyn ProcessGroup>)
            .collect()
    };

    let mut handles = Vec::with_capacity(groups.len());
    for group in groups {
        let config = config.clone();
        let corpora = Arc::clone(&corpora);
        let handle = thread::Builder::new()
            .name(format!("rank-{}", group.rank()))
            .spawn(move || {
                let span = logging::rank_span(group.rank(), group.world_size());
                let _entered = span.enter();
                let result = run_rank(config, &corpora, Arc::clone(&group));
                if result.is_err() {
                    group.abort();
                }
                result
            })
            .context("failed to spawn rank thread")?;
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.join().map_err(|_| anyhow!("rank thread panicked"))?);
    }

    // the rank that failed first reports the cause; the rest only saw the abort
    if let Some(err) = results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .find(|err| !matches!(err, TrainingError::GroupAborted))
    {
        return Err(anyhow!("{err}"));
    }
    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        outcomes.push(result?);
    }
    outcomes
        .first()
        .copied()
        .ok_or_else(|| anyhow!("no ranks were started"))
}

fn load_corpora(config: &RunConfig) -> anyhow::Result<Corpora> {
    let max_length = config.data.max_length;
    let train_path = config
        .data
        .train_data
        .as_ref()
        .context("data.train_data is required")?;
    let train = Arc::new(ByteCorpus::load(train_path, max_length)?);
    let eval = match &config.data.eval_data {
        Some(path) => Arc::new(ByteCorpus::load(path, max_length)?),
        None => {
            warn!("data.eval_data is not set, evaluating on the training corpus");
            Arc::clone(&train)
        }
    };
    let test = match &config.data.test_data {
        Some(path) => Some(Arc::new(ByteCorpus::load(path, max_length)?)),
        None => None,
    };
    Ok(Corpora { train, eval, test })
}

fn run_rank(
    config: RunConfig,
    corpora: &Corpora,
    group: Arc<dyn ProcessGroup>,
) -> training::Result<TrainOutcome> {
    let (rank, world_size) = (group.rank(), group.world_size());
    let batch_size = config.data.batch_size;
    let loader = |dataset: &Arc<TokenDataset>| -> training::Result<Box<dyn DataSource>> {
        Ok(Box::new(ShardedLoader::new(
            Arc::clone(dataset),
            rank,
            world_size,
            batch_size,
        )?))
    };
    let data = TrainerData {
        train: loader(&corpora.train)?,
        eval: loader(&corpora.eval)?,
        test: corpora.test.as_ref().map(loader).transpose()?,
    };

    let sink: Option<Box<dyn MetricsSink>> = if group.is_main() {
        Some(match &config.runtime.metrics_path {
            Some(path) => Box::new(JsonLinesSink::create(path, None)?) as Box<dyn MetricsSink>,
            None => Box::new(TracingSink),
        })
    } else {
        None
    };

    let model = TinyLanguageModel::new(config.model.clone(), &Device::Cpu)?;
    let mut trainer = Trainer::new(config, model, data, group, sink)?;
    let summary = trainer.train()?;
    Ok(summary.outcome)
}

fn apply_overrides(config: RunConfig, overrides: &[OverrideArg]) -> Result<RunConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to deserialize config after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::ConfigFormat("override path must not be empty".into()));
    };
    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!(
                "override path segment '{segment}' points to a non-object value"
            ))
        })?;
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!("cannot set '{last}' on a non-object value"))
    })?;
    map.insert(last.to_string(), new_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse_scalars_and_create_missing_objects() {
        let mut value = serde_json::json!({ "runtime": { "seed": 1 } });
        set_value_at_path(&mut value, "runtime.seed", parse_override_value("7")).unwrap();
        set_value_at_path(&mut value, "relora.interval", parse_override_value("100")).unwrap();
        set_value_at_path(&mut value, "runtime.max_train_tokens", parse_override_value("1B"))
            .unwrap();
        assert_eq!(value["runtime"]["seed"], 7);
        assert_eq!(value["relora"]["interval"], 100);
        assert_eq!(value["runtime"]["max_train_tokens"], "1B");

        assert!(set_value_at_path(&mut value, "runtime.seed.inner", Value::Null).is_err());
        assert!("novalue".parse::<OverrideArg>().is_err());
    }
}
