//! Training infrastructure for CRNN models
//!
//! # Main Components
//!
//! - **Configuration**: optimizer and checkpointing settings
//! - **Trainer**: the training loop, the test pass and checkpoint restore
//! - **Checkpoints**: step-tagged safetensors files behind an atomic pointer
//! - **Optimizers**: Adam(W) with checkpointable moment estimates
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use crnn::training::{CrnnTrainer, TrainingConfig};
//!
//! let mut trainer = CrnnTrainer::new(model, config)?;
//! trainer.train(&data, 10)?;
//! let summary = trainer.test(&data)?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod optimizers;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

pub use checkpoints::{CheckpointInfo, CheckpointManager, CheckpointPointer, POINTER_FILE};
pub use config::{CheckpointPolicy, CheckpointingConfig, OptimizerConfig, TrainingConfig};
pub use optimizers::{AdamWOptimizer, Optimizer};
pub use trainer::{
    test_model, CrnnTrainer, EvaluationSummary, IterationLoss, TrainingState, TrainingStatus,
    TrainingSummary, Transcript,
};
