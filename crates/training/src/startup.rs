//! Launch-time policy: save directory handling, config snapshot, and the
//! decision of what (if anything) to resume from.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use relora_model::{LanguageModel, ParameterRole, ParameterSet};
use tracing::{info, warn};

use crate::{
    checkpoint::{self, TRAINING_CONFIG_FILENAME, MODEL_FILENAME, TRAINING_STATE_FILENAME},
    config::RunConfig,
    distributed::ProcessGroup,
    errors::{Result, TrainingError},
    state::TrainingState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    Fresh,
    /// Full resume: weights, optimizer, scheduler and counters.
    Checkpoint(PathBuf),
    /// Weights plus, when present, the scalar counters. No optimizer state.
    WarmedUp(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub plan: ResumePlan,
    pub run_id: String,
}

/// Collective. Applies the save-directory policy, writes the config snapshot
/// from the main rank and decides the resume plan. May set
/// `config.runtime.resume_from` when autoresuming.
pub fn prepare_launch(config: &mut RunConfig, group: &dyn ProcessGroup) -> Result<Launch> {
    let save_dir = config.runtime.save_dir.clone();
    let mut run_id = None;

    if save_dir.exists() {
        if !config.runtime.autoresume {
            return Err(TrainingError::resume(format!(
                "save directory {} already exists and autoresume is off",
                save_dir.display()
            )));
        }
        warn_on_config_drift(config, &save_dir.join(TRAINING_CONFIG_FILENAME));

        match checkpoint::last_training_state(&save_dir)? {
            Some((state, directory)) => {
                run_id = state.run_id;
                if config.runtime.resume_from.is_none() {
                    config.runtime.resume_from = Some(directory);
                }
            }
            None => {
                if group.is_main() {
                    warn!(
                        save_dir = %save_dir.display(),
                        "no resumable checkpoint found, starting from scratch"
                    );
                }
            }
        }
    }

    let run_id = match run_id {
        Some(run_id) => run_id,
        None => shared_run_id(group)?,
    };

    group.barrier("startup.save_dir_checked")?;
    if group.is_main() {
        fs::create_dir_all(&save_dir)?;
        checkpoint::write_atomic(
            &save_dir.join(TRAINING_CONFIG_FILENAME),
            config.to_yaml()?.as_bytes(),
        )?;
    }
    group.barrier("startup.config_written")?;

    let plan = match (&config.runtime.resume_from, &config.runtime.warmed_up_model) {
        (Some(directory), _) => ResumePlan::Checkpoint(directory.clone()),
        (None, Some(directory)) => ResumePlan::WarmedUp(directory.clone()),
        (None, None) => ResumePlan::Fresh,
    };
    if group.is_main() {
        info!(?plan, run_id = %run_id, "launch prepared");
    }

    Ok(Launch { plan, run_id })
}

/// Milliseconds since the epoch on the main rank, shared with every rank.
fn shared_run_id(group: &dyn ProcessGroup) -> Result<String> {
    let mut stamp = [0.0];
    if group.is_main() {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        stamp[0] = millis as f64;
    }
    group.all_reduce_sum("startup.run_id", &mut stamp)?;
    Ok(format!("run-{:x}", stamp[0] as u64))
}

fn warn_on_config_drift(config: &RunConfig, snapshot: &Path) {
    if !snapshot.is_file() {
        warn!(
            path = %snapshot.display(),
            "training config not found in the existing save directory"
        );
        return;
    }
    let previous = match fs::read_to_string(snapshot)
        .map_err(TrainingError::from)
        .and_then(|contents| RunConfig::from_yaml(&contents))
    {
        Ok(previous) => previous,
        Err(err) => {
            warn!(path = %snapshot.display(), error = %err, "could not read previous training config");
            return;
        }
    };
    if !same_run_parameters(&previous, config) {
        warn!(
            path = %snapshot.display(),
            "arguments have changed since the last run; the training config will be overwritten"
        );
    }
}

/// Ignores the resume pointers, which legitimately change between launches.
fn same_run_parameters(previous: &RunConfig, current: &RunConfig) -> bool {
    let mut previous = previous.clone();
    let mut current = current.clone();
    for config in [&mut previous, &mut current] {
        config.runtime.resume_from = None;
        config.runtime.autoresume = false;
    }
    previous == current
}

/// Settings a checkpoint must share with the resuming run.
pub fn check_resume_compatible(current: &RunConfig, saved: &RunConfig) -> Result<()> {
    if current.data.batch_size != saved.data.batch_size {
        return Err(TrainingError::configuration(format!(
            "cannot resume with batch_size {} from a checkpoint trained with batch_size {}; the data position would be wrong",
            current.data.batch_size, saved.data.batch_size
        )));
    }
    if current.relora.interval != saved.relora.interval {
        return Err(TrainingError::configuration(format!(
            "cannot resume with relora.interval {:?} from a checkpoint trained with {:?}",
            current.relora.interval, saved.relora.interval
        )));
    }
    Ok(())
}

/// Rejects a data source whose vocabulary does not match the model.
pub fn check_vocab(model_vocab: usize, data_vocab: Option<usize>) -> Result<()> {
    match data_vocab {
        Some(data_vocab) if data_vocab != model_vocab => Err(TrainingError::configuration(format!(
            "model vocab_size ({model_vocab}) does not match the data vocabulary ({data_vocab})"
        ))),
        _ => Ok(()),
    }
}

/// A configured adapter must expose adapter parameters, and resets need one.
pub fn check_adapter(config: &RunConfig, model: &dyn LanguageModel) -> Result<()> {
    if config.relora.interval.is_some() && !model.has_adapter() {
        return Err(TrainingError::configuration(
            "relora.interval is set but the model has no adapter",
        ));
    }
    if config.model.adapter.is_some()
        && model
            .parameters()
            .with_role(ParameterRole::Adapter)
            .next()
            .is_none()
    {
        return Err(TrainingError::initialization("no adapter parameters found"));
    }
    Ok(())
}

/// Weights of a warmed-up model plus its counters, if it recorded any.
#[derive(Debug)]
pub struct WarmedUpModel {
    pub weights: HashMap<String, Tensor>,
    pub state: Option<TrainingState>,
}

pub fn load_warmed_up(directory: &Path, device: &Device) -> Result<WarmedUpModel> {
    let weights_path = directory.join(MODEL_FILENAME);
    if !weights_path.is_file() {
        return Err(TrainingError::resume(format!(
            "warmed-up model {} is missing {MODEL_FILENAME}",
            directory.display()
        )));
    }
    let weights = candle_core::safetensors::load(&weights_path, device)?;

    let state_path = directory.join(TRAINING_STATE_FILENAME);
    let state = if state_path.is_file() {
        let state: TrainingState = checkpoint::read_json(&state_path)?;
        info!(
            global_step = state.global_step,
            update_step = state.update_step,
            tokens_seen = state.tokens_seen,
            "loaded training counters from warmed-up model (optimizer state is not restored)"
        );
        Some(state)
    } else {
        warn!(
            directory = %directory.display(),
            "warmed-up model has no training state, counters start from zero"
        );
        None
    };
    Ok(WarmedUpModel { weights, state })
}

/// Strictly loads `weights` into every non-adapter parameter. A warmed-up
/// model predates the adapter, so adapter tensors keep their fresh init.
pub fn apply_base_weights(params: &ParameterSet, weights: &HashMap<String, Tensor>) -> Result<()> {
    let mut base = ParameterSet::new();
    for entry in params.iter().filter(|entry| entry.role != ParameterRole::Adapter) {
        base.push(entry.name.clone(), entry.var.clone(), entry.role);
    }
    checkpoint::apply_model_weights(&base, weights)
}

/// Counters carried over from a warmed-up model. Resets are not inherited.
pub fn warmed_up_state(previous: TrainingState, run_id: String) -> TrainingState {
    TrainingState {
        global_step: previous.global_step,
        update_step: previous.update_step,
        tokens_seen: previous.tokens_seen,
        tokens_seen_before: previous.tokens_seen_before,
        n_resets: 0,
        update_time: 0.0,
        run_id: Some(run_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SingleProcess;
    use tempfile::tempdir;

    fn config(save_dir: &Path) -> RunConfig {
        let yaml = format!(
            r#"
model: {{ vocab_size: 16, hidden_dim: 8, n_layers: 1 }}
data: {{ batch_size: 2 }}
runtime:
  save_dir: {}
  num_training_steps: 10
"#,
            save_dir.display()
        );
        RunConfig::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn fresh_launch_writes_config_snapshot() {
        let dir = tempdir().unwrap();
        let save_dir = dir.path().join("run");
        let mut config = config(&save_dir);
        let launch = prepare_launch(&mut config, &SingleProcess::new()).unwrap();
        assert_eq!(launch.plan, ResumePlan::Fresh);
        assert!(launch.run_id.starts_with("run-"));

        let written = fs::read_to_string(save_dir.join(TRAINING_CONFIG_FILENAME)).unwrap();
        assert_eq!(RunConfig::from_yaml(&written).unwrap(), config);
    }

    #[test]
    fn existing_save_dir_requires_autoresume() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        let err = prepare_launch(&mut config, &SingleProcess::new()).unwrap_err();
        assert!(matches!(err, TrainingError::ResumeInconsistency(_)));

        config.runtime.autoresume = true;
        let launch = prepare_launch(&mut config, &SingleProcess::new()).unwrap();
        assert_eq!(launch.plan, ResumePlan::Fresh);
    }

    #[test]
    fn warmed_up_model_is_used_when_nothing_to_resume() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir.path().join("run"));
        config.runtime.warmed_up_model = Some(dir.path().join("warm"));
        let launch = prepare_launch(&mut config, &SingleProcess::new()).unwrap();
        assert_eq!(launch.plan, ResumePlan::WarmedUp(dir.path().join("warm")));
    }

    #[test]
    fn resume_rejects_changed_batch_size_and_interval() {
        let dir = tempdir().unwrap();
        let saved = config(dir.path());
        let mut current = saved.clone();
        assert!(check_resume_compatible(&current, &saved).is_ok());

        current.data.batch_size = 4;
        assert!(matches!(
            check_resume_compatible(&current, &saved),
            Err(TrainingError::Configuration(_))
        ));

        let mut current = saved.clone();
        current.relora.interval = Some(50);
        assert!(check_resume_compatible(&current, &saved).is_err());
    }

    #[test]
    fn resume_pointers_do_not_count_as_drift() {
        let dir = tempdir().unwrap();
        let previous = config(dir.path());
        let mut current = previous.clone();
        current.runtime.autoresume = true;
        current.runtime.resume_from = Some(dir.path().join("model_5"));
        assert!(same_run_parameters(&previous, &current));

        current.optimizer.lr = 1.0;
        assert!(!same_run_parameters(&previous, &current));
    }

    #[test]
    fn vocab_mismatch_is_a_configuration_error() {
        assert!(check_vocab(256, Some(256)).is_ok());
        assert!(check_vocab(256, None).is_ok());
        assert!(matches!(
            check_vocab(16, Some(256)),
            Err(TrainingError::Configuration(_))
        ));
    }
}
