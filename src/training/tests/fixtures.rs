//! Test fixtures for setting up common test scenarios

use anyhow::Result;
use candle_core::Device;
use ndarray::Array4;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::ModelConfig;
use crate::data::{Batch, DataManager, LabelCodec, SparseTarget};
use crate::engine::Engine;
use crate::model::{Crnn, IMAGE_HEIGHT};
use crate::training::{CheckpointManager, CrnnTrainer, TrainingConfig};

/// Alphabet of the fixture models
pub const ALPHABET: &str = "ab";

/// Image width of the fixture models; yields three timesteps
pub const IMAGE_WIDTH: usize = 16;

/// Small model configuration shared by the training tests
pub fn model_config() -> ModelConfig {
    ModelConfig {
        alphabet: ALPHABET.to_string(),
        max_image_width: IMAGE_WIDTH,
        ..Default::default()
    }
}

/// Fresh fixture model on the CPU
pub fn tiny_model() -> Result<Crnn> {
    Ok(Crnn::new(&model_config(), Engine::with_device(Device::Cpu))?)
}

/// Training configuration writing checkpoints to `dir`
pub fn training_config(dir: &Path, restore: bool) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.optimizer.learning_rate = 1e-3;
    config.checkpointing.output_dir = Some(dir.to_path_buf());
    config.checkpointing.restore = restore;
    config.iteration_count = 1;
    config
}

/// Batch whose images draw one bright vertical band per character, at a
/// column offset that depends on the character.
pub fn banded_batch(labels: &[&str]) -> Result<Batch> {
    let codec = LabelCodec::new(ALPHABET)?;
    let mut images = Array4::<f32>::zeros((labels.len(), IMAGE_WIDTH, IMAGE_HEIGHT, 1));
    let mut targets = Vec::with_capacity(labels.len());

    for (i, label) in labels.iter().enumerate() {
        let encoded = codec.encode(label)?;
        for (k, &class) in encoded.iter().enumerate() {
            let start = k * 5 + class as usize * 2;
            for x in start..(start + 2).min(IMAGE_WIDTH) {
                for y in 8..24 {
                    images[[i, x, y, 0]] = 1.0;
                }
            }
        }
        targets.push(encoded);
    }

    Ok(Batch {
        ground_truth: labels.iter().map(|l| l.to_string()).collect(),
        targets: SparseTarget::from_sequences(&targets),
        images,
    })
}

/// Checkpoint directory with a fixed training and test split
pub struct TrainingTestFixture {
    /// Owns the temporary directory for the fixture's lifetime
    pub temp_dir: TempDir,
    /// Checkpoint directory inside `temp_dir`; not created up front
    pub checkpoint_dir: PathBuf,
    /// One training batch and one test batch of banded images
    pub data: DataManager,
}

impl TrainingTestFixture {
    /// Fresh temporary directory and the fixed split
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let checkpoint_dir = temp_dir.path().join("model");

        let train = vec![banded_batch(&["a", "ab"])?];
        let test = vec![banded_batch(&["b", "ba", "a"])?];

        Ok(Self {
            temp_dir,
            checkpoint_dir,
            data: DataManager::from_batches(2, train, test),
        })
    }

    /// Training configuration pointing at the fixture's checkpoint directory
    pub fn training_config(&self, restore: bool) -> TrainingConfig {
        training_config(&self.checkpoint_dir, restore)
    }

    /// Trainer over a fresh fixture model
    pub fn create_trainer(&self, restore: bool) -> Result<CrnnTrainer> {
        Ok(CrnnTrainer::new(tiny_model()?, self.training_config(restore))?)
    }

    /// Manager over the fixture's checkpoint directory, keeping ten checkpoints
    pub fn checkpoint_manager(&self) -> Result<CheckpointManager> {
        Ok(CheckpointManager::new(&self.checkpoint_dir, Some(10))?)
    }
}
