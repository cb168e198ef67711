use line_data::dataset::{DatasetConfig, Split};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub name: String,
    pub dataset: DatasetSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub loss: LossSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    pub trainer: TrainerSection,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }

        if self.dataset.options.img_height == 0 {
            errors.push("dataset.img_height must be greater than 0".to_string());
        }

        if self.dataset.options.max_width == 0 {
            errors.push("dataset.max_width must be greater than 0".to_string());
        }

        if self.dataset.options.a_batch_size == 0 {
            errors.push("dataset.a_batch_size must be greater than 0".to_string());
        }

        if self.trainer.batch_size == 0 {
            errors.push("trainer.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.trainer.epochs == 0 && self.trainer.max_steps.unwrap_or(0) == 0 {
            errors.push("trainer must specify `epochs` and/or `max_steps`".to_string());
        }

        if self.trainer.log_every_n_steps == 0 {
            errors.push("trainer.log_every_n_steps must be greater than 0".to_string());
        }

        if self.trainer.save_every_n_steps == 0 {
            errors.push("trainer.save_every_n_steps must be greater than 0".to_string());
        }

        if let Some(0) = self.trainer.max_keep {
            errors.push("trainer.max_keep must be greater than 0".to_string());
        }

        if self.trainer.save_dir.as_os_str().is_empty() {
            errors.push("trainer.save_dir must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.dataset.root, base);
        absolutize_in_place(&mut self.dataset.options.char_file, base);
        for path in [
            self.dataset.options.fg_masks_dir.as_mut(),
            self.dataset.options.cache_normalized.as_mut(),
            self.dataset.options.spaced_loc.as_mut(),
        ] {
            if let Some(path) = path {
                absolutize_in_place(path, base);
            }
        }
        if let Some(pattern) = self.dataset.options.style_loc.as_mut() {
            if Path::new(pattern.as_str()).is_relative() {
                *pattern = base.join(pattern.as_str()).to_string_lossy().into_owned();
            }
        }
        absolutize_in_place(&mut self.trainer.save_dir, base);
    }

    /// Run name implied by the config file: the file stem with a leading
    /// `cf_` prefix removed. Startup refuses configs whose `name` field
    /// disagrees with the filename.
    pub fn derived_run_name(path: &Path) -> Result<String, TrainingError> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                TrainingError::ConfigFormat(format!(
                    "config path {} has no usable file name",
                    path.display()
                ))
            })?;
        Ok(stem.strip_prefix("cf_").unwrap_or(stem).to_string())
    }

    pub fn ensure_matches_filename(&self, path: &Path) -> Result<(), TrainingError> {
        let derived = Self::derived_run_name(path)?;
        if derived != self.name {
            return Err(TrainingError::validation(vec![format!(
                "run name '{}' does not match config filename '{}' (expected name '{}')",
                self.name,
                path.display(),
                derived
            )]));
        }
        Ok(())
    }

    /// Directory holding this run's checkpoints.
    pub fn run_dir(&self) -> PathBuf {
        self.trainer.save_dir.join(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSection {
    pub root: PathBuf,
    #[serde(default = "default_split")]
    pub split: Split,
    #[serde(flatten)]
    pub options: DatasetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_tag")]
    pub tag: String,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            tag: default_model_tag(),
            hidden_size: default_hidden_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossSection {
    #[serde(default = "default_loss_tag")]
    pub tag: String,
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            tag: default_loss_tag(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSection {
    pub save_dir: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_save_every_n_steps")]
    pub save_every_n_steps: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_split() -> Split {
    Split::Train
}

fn default_model_tag() -> String {
    "line_crnn".to_string()
}

fn default_hidden_size() -> usize {
    64
}

fn default_loss_tag() -> String {
    "spaced_cross_entropy".to_string()
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_epochs() -> usize {
    1
}

fn default_batch_size() -> usize {
    1
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_save_every_n_steps() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<line_data::DataError> for TrainingError {
    fn from(value: line_data::DataError) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        r#"
name = "demo"

[dataset]
root = "corpus"
img_height = 64
char_file = "chars.json"

[trainer]
save_dir = "runs"
max_steps = 5
"#
        .to_string()
    }

    #[test]
    fn loads_toml_and_absolutizes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_demo.toml");
        write!(fs::File::create(&path).unwrap(), "{}", minimal_toml()).unwrap();
        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.name, "demo");
        assert!(config.dataset.root.is_absolute());
        assert!(config.dataset.options.char_file.is_absolute());
        assert!(config.trainer.save_dir.is_absolute());
        assert_eq!(config.dataset.options.max_width, 3000);
    }

    #[test]
    fn run_name_strips_config_prefix() {
        assert_eq!(
            TrainingConfig::derived_run_name(Path::new("/tmp/cf_big_run.toml")).unwrap(),
            "big_run"
        );
        assert_eq!(
            TrainingConfig::derived_run_name(Path::new("plain.json")).unwrap(),
            "plain"
        );
    }

    #[test]
    fn mismatched_filename_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_other.toml");
        write!(fs::File::create(&path).unwrap(), "{}", minimal_toml()).unwrap();
        let config = TrainingConfig::from_path(&path).unwrap();
        assert!(config.ensure_matches_filename(&path).is_err());
        let matching = dir.path().join("cf_demo.toml");
        assert!(config.ensure_matches_filename(&matching).is_ok());
    }

    #[test]
    fn validation_collects_every_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_bad.toml");
        write!(
            fs::File::create(&path).unwrap(),
            r#"
name = ""

[dataset]
root = "corpus"
img_height = 0
char_file = "chars.json"

[optimizer]
learning_rate = 0.0
beta1 = 1.5

[trainer]
save_dir = "runs"
epochs = 0
"#
        )
        .unwrap();
        match TrainingConfig::from_path(&path) {
            Err(TrainingError::Validation(messages)) => {
                assert!(messages.len() >= 4, "collected: {:?}", messages);
            }
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
    }
}
