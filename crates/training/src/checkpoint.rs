use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    history::TrainingHistory,
    model::Recognizer,
    optimizer::{AdamW, OptimizerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const CONFIG_FILENAME: &str = "config.json";
const HISTORY_FILENAME: &str = "history.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-step-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    pub global_step: usize,
    pub epoch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub config: FileRecord,
    pub history: FileRecord,
    pub progress: ProgressSnapshot,
}

pub struct SaveRequest<'a> {
    pub run_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a dyn Recognizer,
    pub optimizer: &'a AdamW,
    pub history: &'a TrainingHistory,
    pub progress: ProgressSnapshot,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub history: TrainingHistory,
    pub model_weights_path: PathBuf,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.run_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create run directory {}: {err}",
            request.run_dir.display()
        ))
    })?;

    let dir_name = format!("{}{:08}", CHECKPOINT_PREFIX, request.progress.global_step);
    let checkpoint_dir = request.run_dir.join(dir_name);
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_state = request.optimizer.state()?;
    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &optimizer_state)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let config_path = checkpoint_dir.join(CONFIG_FILENAME);
    write_json(&config_path, request.config)?;
    let config_record = file_record(&config_path)?;

    let history_path = checkpoint_dir.join(HISTORY_FILENAME);
    request.history.save(&history_path)?;
    let history_record = file_record(&history_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        config: config_record,
        history: history_record,
        progress: request.progress,
    };

    let manifest_path = checkpoint_dir.join(MANIFEST_FILENAME);
    write_json(&manifest_path, &manifest)?;

    prune_checkpoints(request.run_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

pub fn latest_checkpoint(run_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let entries = checkpoint_directories(run_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let history_path = directory.join(&manifest.history.filename);
    validate_file(&history_path, &manifest.history.sha256)?;
    let history = TrainingHistory::load(&history_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        history,
        model_weights_path: model_path,
    })
}

/// Copies checkpointed weights into the model's parameters by name. Missing
/// or surplus parameters are an error.
pub fn apply_model_weights(
    model: &dyn Recognizer,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = candle_core::Device::Cpu;
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to load weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.named_parameters()? {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn save_model_weights(model: &dyn Recognizer, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.named_parameters()?;
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read run directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(CHECKPOINT_PREFIX)
        {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
