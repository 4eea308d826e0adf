use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder substituted by a checkpoint tag in `TrainConfig::model_file`.
pub const TAG_PLACEHOLDER: &str = "{}";

/// Mixed-precision mode requested from the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    No,
    Fp16,
    #[default]
    Bf16,
}

impl std::fmt::Display for MixedPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::No => "no",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(s)
    }
}

/// Immutable run parameters for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub seed: u64,
    pub epochs: usize,
    pub batch_size_per_gpu: usize,
    pub learn_rate: f64,
    pub div_factor: f64,
    pub mixed_precision: MixedPrecision,
    pub gradient_accumulation_steps: usize,
    pub max_grad_norm: f64,
    pub log_interval: usize,
    pub keep_latest_n_ckp: usize,
    pub max_seq_len: usize,

    pub train_file: PathBuf,
    pub validation_file: PathBuf,
    pub test_file: PathBuf,
    pub tokenizer_file: PathBuf,
    /// Checkpoint path template; `{}` is replaced by the epoch or exit tag.
    pub model_file: String,
    pub model_config_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seed: 23333,
            epochs: 8,
            batch_size_per_gpu: 16,
            learn_rate: 0.0001,
            div_factor: 50.0,
            mixed_precision: MixedPrecision::Bf16,
            gradient_accumulation_steps: 8,
            max_grad_norm: 1.0,
            log_interval: 50,
            keep_latest_n_ckp: 8,
            max_seq_len: 256,
            train_file: PathBuf::from("./data/my_train_dataset.jsonl"),
            validation_file: PathBuf::from("./data/my_valid_dataset.jsonl"),
            test_file: PathBuf::from("./data/my_test_dataset.jsonl"),
            tokenizer_file: PathBuf::from("./model_save/tokenizer.json"),
            model_file: "./model_save/chat_small_t5.{}.pth".to_string(),
            model_config_file: PathBuf::from("./model_save/model_config.json"),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl TrainConfig {
    /// Load and validate a config from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.batch_size_per_gpu == 0 {
            return Err(TrainingError::InvalidConfig("batch_size_per_gpu must be >= 1".to_string()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainingError::InvalidConfig(
                "gradient_accumulation_steps must be >= 1".to_string(),
            ));
        }
        if !self.learn_rate.is_finite() || self.learn_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learn_rate must be > 0".to_string()));
        }
        if !self.div_factor.is_finite() || self.div_factor < 1.0 {
            return Err(TrainingError::InvalidConfig("div_factor must be >= 1".to_string()));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(TrainingError::InvalidConfig("max_grad_norm must be > 0".to_string()));
        }
        if self.log_interval == 0 {
            return Err(TrainingError::InvalidConfig("log_interval must be >= 1".to_string()));
        }
        if self.keep_latest_n_ckp == 0 {
            return Err(TrainingError::InvalidConfig("keep_latest_n_ckp must be >= 1".to_string()));
        }
        if self.max_seq_len == 0 {
            return Err(TrainingError::InvalidConfig("max_seq_len must be >= 1".to_string()));
        }
        if !self.model_file.contains(TAG_PLACEHOLDER) {
            return Err(TrainingError::InvalidConfig(format!(
                "model_file must contain a `{TAG_PLACEHOLDER}` tag placeholder: {}",
                self.model_file
            )));
        }
        if !self.model_file.ends_with(".pth") {
            return Err(TrainingError::InvalidConfig(format!(
                "model_file must end with `.pth`: {}",
                self.model_file
            )));
        }
        Ok(())
    }
}

/// Architecture hyperparameters handed to the model backend.
///
/// `vocab_size` is injected once from the tokenizer before the model is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_ff: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub d_kv: usize,
    pub num_layers: usize,
    pub num_decoder_layers: usize,
    pub dropout_rate: f64,
    pub vocab_size: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_ff: 3072,
            d_model: 768,
            num_heads: 12,
            d_kv: 64,
            num_layers: 10,
            num_decoder_layers: 10,
            dropout_rate: 0.1,
            vocab_size: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.d_model == 0 || self.d_ff == 0 || self.d_kv == 0 {
            return Err(TrainingError::InvalidConfig("model dimensions must be >= 1".to_string()));
        }
        if self.num_heads == 0 {
            return Err(TrainingError::InvalidConfig("num_heads must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(TrainingError::InvalidConfig("dropout_rate must be in [0, 1)".to_string()));
        }
        Ok(())
    }

    /// Returns a copy with the tokenizer's vocabulary size filled in.
    pub fn with_vocab_size(&self, vocab_size: usize) -> TrainingResult<Self> {
        if vocab_size == 0 {
            return Err(TrainingError::InvalidConfig("tokenizer vocab is empty".to_string()));
        }
        if let Some(existing) = self.vocab_size {
            if existing != vocab_size {
                return Err(TrainingError::InvalidConfig(format!(
                    "vocab_size already set to {existing}, tokenizer reports {vocab_size}"
                )));
            }
        }
        Ok(Self { vocab_size: Some(vocab_size), ..self.clone() })
    }

    /// Fields that differ from `ModelConfig::default()`, as a JSON object.
    pub fn diff_from_default(&self) -> TrainingResult<serde_json::Value> {
        let current = serde_json::to_value(self)?;
        let baseline = serde_json::to_value(Self::default())?;

        let mut diff = serde_json::Map::new();
        if let (Some(cur), Some(base)) = (current.as_object(), baseline.as_object()) {
            for (key, value) in cur {
                if base.get(key) != Some(value) {
                    diff.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(serde_json::Value::Object(diff))
    }

    /// Write the diff-from-default sidecar used to rebuild the architecture later.
    pub fn save_diff(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.diff_from_default()?)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Config file layout accepted by the CLI: `[train]` and `[model]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub train: TrainConfig,
    pub model: ModelConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.train.validate()?;
        config.model.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> TrainingResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TrainingError::InvalidConfig(format!("failed to serialize config: {e}")))
    }
}
