//! Configuration structures for the CRNN system

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::cnn;
use crate::training::config::TrainingConfig;

/// Alphabet used when no other is configured: digits then lowercase latin.
pub const DEFAULT_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

/// Main configuration for the CRNN system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrnnConfig {
    /// Network geometry and inference settings
    pub model: ModelConfig,
    /// Optimization, checkpointing and loop settings
    pub training: TrainingConfig,
    /// Example discovery and batching
    pub data: DataConfig,
    /// Device the engine runs on
    pub device: DeviceKind,
}

impl CrnnConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file, chosen by extension
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.data.validate()?;
        Ok(())
    }

    /// Directory holding checkpoints; required for any model construction
    pub fn model_path(&self) -> Result<&Path> {
        self.training
            .checkpointing
            .output_dir
            .as_deref()
            .ok_or_else(|| Error::config("A model path (checkpoint directory) is required"))
    }

    /// Directory holding example images; required for any data loading
    pub fn examples_path(&self) -> Result<&Path> {
        self.data
            .examples_path
            .as_deref()
            .ok_or_else(|| Error::config("An examples path is required"))
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Network geometry and inference configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Output alphabet; the blank class is appended after it
    pub alphabet: String,
    /// Width every input image is padded or truncated to
    pub max_image_width: usize,
    /// How the batch-normalization layers treat their statistics
    pub batch_norm: BatchNormMode,
    /// Inference decoding strategy
    pub decoder: DecoderKind,
    /// Seed for the classifier head initialization
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            max_image_width: 100,
            batch_norm: BatchNormMode::Frozen,
            decoder: DecoderKind::default(),
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Number of output classes including the blank
    pub fn num_classes(&self) -> usize {
        self.alphabet.chars().count() + 1
    }

    /// Validate model configuration
    pub fn validate(&self) -> Result<()> {
        if self.alphabet.is_empty() {
            return Err(Error::config("Alphabet must not be empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for c in self.alphabet.chars() {
            if !seen.insert(c) {
                return Err(Error::config(format!(
                    "Alphabet contains '{c}' more than once"
                )));
            }
        }

        cnn::sequence_length_for_width(self.max_image_width)
            .map_err(|e| Error::config(e.to_string()))?;

        if let DecoderKind::BeamSearch { width } = self.decoder {
            if width == 0 {
                return Err(Error::config("Beam width must be > 0"));
            }
        }

        Ok(())
    }
}

/// Treatment of batch-normalization statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchNormMode {
    /// Batch statistics while training, running statistics at inference
    Batch,
    /// Running statistics always; they keep their initial values
    Frozen,
}

/// Decoding strategy used at inference
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// CTC prefix beam search keeping `width` prefixes per timestep
    BeamSearch {
        /// Number of prefixes kept
        width: usize,
    },
    /// Arg-max per timestep then collapse
    Greedy,
}

impl Default for DecoderKind {
    fn default() -> Self {
        DecoderKind::BeamSearch { width: 100 }
    }
}

/// Example discovery and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Directory of `<label>_<anything>.<ext>` images
    pub examples_path: Option<PathBuf>,
    /// Examples per batch
    pub batch_size: usize,
    /// Fraction of examples used for training; the rest is for testing
    pub train_test_ratio: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            examples_path: None,
            batch_size: 64,
            train_test_ratio: 0.70,
        }
    }
}

impl DataConfig {
    /// Validate data configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.train_test_ratio) {
            return Err(Error::config(format!(
                "Train/test ratio must be within [0, 1], got {}",
                self.train_test_ratio
            )));
        }
        Ok(())
    }
}

/// Device types
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CPU device
    #[default]
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl std::str::FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" => Ok(DeviceKind::Cuda),
            "metal" => Ok(DeviceKind::Metal),
            other => Err(Error::config(format!("Unknown device '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrnnConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.num_classes(), 37);
    }

    #[test]
    fn test_batch_norm_defaults_to_frozen() {
        let config = ModelConfig::default();
        assert_eq!(config.batch_norm, BatchNormMode::Frozen);
        assert_eq!(
            serde_json::to_value(config.batch_norm).unwrap(),
            serde_json::json!("frozen")
        );
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = CrnnConfig::default();
        config.data.train_test_ratio = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_narrow_images() {
        let mut config = CrnnConfig::default();
        config.model.max_image_width = 7;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_alphabet() {
        let mut config = CrnnConfig::default();
        config.model.alphabet = "abca".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_paths_are_config_errors() {
        let config = CrnnConfig::default();
        assert!(matches!(config.model_path(), Err(Error::Config(_))));
        assert!(matches!(config.examples_path(), Err(Error::Config(_))));
    }

    #[test]
    fn test_yaml_and_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CrnnConfig::default();
        config.data.batch_size = 8;
        config.model.decoder = DecoderKind::Greedy;

        for name in ["config.json", "config.yaml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = CrnnConfig::from_file(&path).unwrap();
            assert_eq!(loaded.data, config.data);
            assert_eq!(loaded.model, config.model);
        }
    }

    #[test]
    fn test_device_kind_parsing() {
        assert_eq!("CPU".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }
}
