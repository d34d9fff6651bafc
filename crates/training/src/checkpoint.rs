use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use relora_model::ParameterSet;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    config::RunConfig,
    distributed::ProcessGroup,
    errors::{Result, TrainingError},
    optimizer::{OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    state::TrainingState,
};

pub const MODEL_FILENAME: &str = "model.safetensors";
pub const OPTIMIZER_FILENAME: &str = "optimizer.json";
pub const TRAINING_STATE_FILENAME: &str = "training_state.json";
pub const TRAINING_CONFIG_FILENAME: &str = "training_config.yaml";
const CHECKPOINT_PREFIX: &str = "model_";

/// Contents of `optimizer.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerCheckpoint {
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub update_step: usize,
    pub global_step: usize,
    pub config: RunConfig,
    pub dtype: String,
    pub weights_sha256: String,
}

pub struct SaveRequest<'a> {
    pub save_root: &'a Path,
    pub params: &'a ParameterSet,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub state: &'a TrainingState,
    pub config: &'a RunConfig,
    pub max_keep: Option<usize>,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub weights: HashMap<String, Tensor>,
    pub optimizer: OptimizerCheckpoint,
    pub state: TrainingState,
}

pub fn checkpoint_dir(save_root: &Path, update_step: usize) -> PathBuf {
    save_root.join(format!("{CHECKPOINT_PREFIX}{update_step}"))
}

/// Collective save. The main rank writes weights, every rank joins the
/// optimizer consolidation, then the main rank writes `optimizer.json` and
/// finally `training_state.json`, which marks the directory complete.
pub fn save_checkpoint(request: SaveRequest<'_>, group: &dyn ProcessGroup) -> Result<PathBuf> {
    let directory = checkpoint_dir(request.save_root, request.state.update_step);

    let weights_sha256 = if group.is_main() {
        prepare_directory(&directory)?;
        let weights_path = directory.join(MODEL_FILENAME);
        save_model_weights(request.params, &weights_path)?;
        sha256_file(&weights_path)?
    } else {
        String::new()
    };
    group.barrier("checkpoint.weights_written")?;

    let optimizer_state = request.optimizer.consolidate(group)?;

    if group.is_main() {
        let record = OptimizerCheckpoint {
            optimizer: optimizer_state,
            scheduler: request.scheduler.snapshot(),
            update_step: request.state.update_step,
            global_step: request.state.global_step,
            config: request.config.clone(),
            dtype: request.config.runtime.dtype.clone(),
            weights_sha256,
        };
        write_json(&directory.join(OPTIMIZER_FILENAME), &record)?;
        write_json(&directory.join(TRAINING_STATE_FILENAME), request.state)?;
        info!(
            directory = %directory.display(),
            update_step = request.state.update_step,
            "saved checkpoint"
        );
        prune_checkpoints(request.save_root, request.max_keep)?;
    }
    group.barrier("checkpoint.complete")?;

    Ok(directory)
}

/// Strict load: every part must exist, the weights must match their
/// recorded checksum and all parts must agree on the step counters.
pub fn load_checkpoint(directory: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    for filename in [MODEL_FILENAME, OPTIMIZER_FILENAME, TRAINING_STATE_FILENAME] {
        let path = directory.join(filename);
        if !path.is_file() {
            return Err(TrainingError::resume(format!(
                "checkpoint {} is missing {filename}",
                directory.display()
            )));
        }
    }

    let weights_path = directory.join(MODEL_FILENAME);
    let optimizer: OptimizerCheckpoint = read_json(&directory.join(OPTIMIZER_FILENAME))?;
    let state: TrainingState = read_json(&directory.join(TRAINING_STATE_FILENAME))?;

    if sha256_file(&weights_path)? != optimizer.weights_sha256 {
        return Err(TrainingError::checkpoint(format!(
            "{} failed checksum validation",
            weights_path.display()
        )));
    }
    if optimizer.update_step != state.update_step || optimizer.global_step != state.global_step {
        return Err(TrainingError::resume(format!(
            "checkpoint parts disagree: optimizer at update {} / global {}, training state at update {} / global {}",
            optimizer.update_step, optimizer.global_step, state.update_step, state.global_step
        )));
    }
    if let Some(step) = step_from_dir_name(directory) {
        if step != state.update_step {
            return Err(TrainingError::resume(format!(
                "{} holds update step {}",
                directory.display(),
                state.update_step
            )));
        }
    }

    let weights = candle_core::safetensors::load(&weights_path, device)?;
    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        weights,
        optimizer,
        state,
    })
}

/// Copies checkpoint tensors into the model's variables. Missing, extra or
/// differently shaped tensors abort the load.
pub fn apply_model_weights(params: &ParameterSet, weights: &HashMap<String, Tensor>) -> Result<()> {
    let mut remaining: HashMap<&str, &Tensor> =
        weights.iter().map(|(name, tensor)| (name.as_str(), tensor)).collect();

    for entry in params.iter() {
        let tensor = remaining.remove(entry.name.as_str()).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {}", entry.name))
        })?;
        if tensor.dims() != entry.var.as_tensor().dims() {
            return Err(TrainingError::checkpoint(format!(
                "shape mismatch for {}: model {:?}, checkpoint {:?}",
                entry.name,
                entry.var.as_tensor().dims(),
                tensor.dims()
            )));
        }
        let tensor = tensor.to_dtype(entry.var.as_tensor().dtype())?;
        entry.var.set(&tensor)?;
    }

    if !remaining.is_empty() {
        let mut extra: Vec<_> = remaining.into_keys().collect();
        extra.sort_unstable();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

/// A directory is resumable only once both the weights and the training
/// state were written.
pub fn is_resumable(directory: &Path) -> bool {
    directory.join(MODEL_FILENAME).is_file() && directory.join(TRAINING_STATE_FILENAME).is_file()
}

/// Newest resumable `model_{step}` directory under `save_root`.
pub fn latest_resumable(save_root: &Path) -> Result<Option<PathBuf>> {
    let mut candidates = checkpoint_directories(save_root)?;
    candidates.sort_by_key(|(step, _)| *step);
    while let Some((step, directory)) = candidates.pop() {
        if is_resumable(&directory) {
            return Ok(Some(directory));
        }
        warn!(
            update_step = step,
            directory = %directory.display(),
            "skipping incomplete checkpoint"
        );
    }
    Ok(None)
}

/// Reads only the training state of the newest resumable checkpoint.
pub fn last_training_state(save_root: &Path) -> Result<Option<(TrainingState, PathBuf)>> {
    let Some(directory) = latest_resumable(save_root)? else {
        return Ok(None);
    };
    let state = read_json(&directory.join(TRAINING_STATE_FILENAME))?;
    Ok(Some((state, directory)))
}

pub fn prune_checkpoints(save_root: &Path, max_keep: Option<usize>) -> Result<()> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(save_root)?;
    dirs.sort_by_key(|(step, _)| *step);
    while dirs.len() > limit {
        let (_, victim) = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

/// Writes `bytes` to a temporary sibling and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temporary_path(path);
    let mut file = File::create(&tmp).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", tmp.display()))
    })?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", tmp.display()))
        })?;
    fs::rename(&tmp, path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to move {} into place: {err}", path.display()))
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    write_atomic(path, &data)
}

fn prepare_directory(directory: &Path) -> Result<()> {
    if directory.exists() {
        warn!(directory = %directory.display(), "replacing existing checkpoint");
        fs::remove_dir_all(directory).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                directory.display()
            ))
        })?;
    }
    fs::create_dir_all(directory).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })
}

fn save_model_weights(params: &ParameterSet, path: &Path) -> Result<()> {
    if params.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = params
        .iter()
        .map(|entry| (entry.name.clone(), entry.var.as_tensor().clone()))
        .collect();
    let tmp = temporary_path(path);
    candle_core::safetensors::save(&tensors, &tmp).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize model weights to {}: {err}",
            tmp.display()
        ))
    })?;
    fs::rename(&tmp, path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to move {} into place: {err}", path.display()))
    })
}

fn temporary_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn step_from_dir_name(directory: &Path) -> Option<usize> {
    directory
        .file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(step) = step_from_dir_name(&path) {
            dirs.push((step, path));
        }
    }
    Ok(dirs)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch_checkpoint(root: &Path, step: usize, complete: bool) -> PathBuf {
        let dir = checkpoint_dir(root, step);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MODEL_FILENAME), b"weights").unwrap();
        if complete {
            fs::write(dir.join(TRAINING_STATE_FILENAME), b"{}").unwrap();
        }
        dir
    }

    #[test]
    fn latest_skips_incomplete_directories() {
        let root = tempdir().unwrap();
        touch_checkpoint(root.path(), 5, true);
        touch_checkpoint(root.path(), 20, true);
        touch_checkpoint(root.path(), 100, false);
        fs::create_dir_all(root.path().join("model_final")).unwrap();

        let latest = latest_resumable(root.path()).unwrap().unwrap();
        assert_eq!(latest, checkpoint_dir(root.path(), 20));
    }

    #[test]
    fn numeric_order_beats_lexical_order() {
        let root = tempdir().unwrap();
        touch_checkpoint(root.path(), 9, true);
        touch_checkpoint(root.path(), 10, true);
        assert_eq!(
            latest_resumable(root.path()).unwrap(),
            Some(checkpoint_dir(root.path(), 10))
        );
    }

    #[test]
    fn missing_root_has_no_checkpoint() {
        let root = tempdir().unwrap();
        assert!(latest_resumable(&root.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn pruning_keeps_newest() {
        let root = tempdir().unwrap();
        for step in [1, 2, 10, 30] {
            touch_checkpoint(root.path(), step, true);
        }
        prune_checkpoints(root.path(), Some(2)).unwrap();
        assert!(!checkpoint_dir(root.path(), 1).exists());
        assert!(!checkpoint_dir(root.path(), 2).exists());
        assert!(checkpoint_dir(root.path(), 10).exists());
        assert!(checkpoint_dir(root.path(), 30).exists());
    }

    #[test]
    fn atomic_write_leaves_no_temporary() {
        let root = tempdir().unwrap();
        let path = root.path().join("state.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!temporary_path(&path).exists());
    }

    #[test]
    fn load_requires_every_part() {
        let root = tempdir().unwrap();
        let dir = touch_checkpoint(root.path(), 3, true);
        let err = load_checkpoint(&dir, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TrainingError::ResumeInconsistency(_)));
        assert!(err.to_string().contains(OPTIMIZER_FILENAME));
    }
}
