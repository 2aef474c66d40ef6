//! Training configuration for the CRNN trainer
//!
//! Optimizer hyper-parameters, checkpointing policy and loop settings. The
//! defaults are Adam at `1e-4`, ten iterations, a transcript every ten
//! iterations and a checkpoint after every batch.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Checkpointing configuration
    pub checkpointing: CheckpointingConfig,

    /// Number of passes over the training batches
    pub iteration_count: usize,

    /// Print a transcript of the first example every this many iterations
    pub display_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            iteration_count: 10,
            display_every: 10,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;

        if self.display_every == 0 {
            return Err(Error::config("Display interval must be > 0"));
        }

        if self.checkpointing.save_total_limit == Some(0) {
            return Err(Error::config(
                "Checkpoint retention limit must be > 0 (omit it to keep every checkpoint)",
            ));
        }

        Ok(())
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// Beta1 parameter
    pub beta1: f64,

    /// Beta2 parameter
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,

    /// Decoupled weight decay; zero gives plain Adam
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }
        if self.epsilon <= 0.0 {
            return Err(Error::config("Epsilon must be positive"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        Ok(())
    }
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Directory checkpoints are written to and restored from
    pub output_dir: Option<PathBuf>,

    /// Restore the latest checkpoint at construction
    pub restore: bool,

    /// Keep at most this many checkpoint files; `None` keeps all
    pub save_total_limit: Option<usize>,

    /// When checkpoints are written
    pub policy: CheckpointPolicy,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            restore: false,
            save_total_limit: Some(10),
            policy: CheckpointPolicy::EveryBatch,
        }
    }
}

/// When the trainer persists a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every training batch; a crash loses at most one batch
    #[default]
    EveryBatch,
    /// After every full pass over the training batches
    EveryIteration,
}
