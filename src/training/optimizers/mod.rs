//! Optimizers for CRNN training

pub mod adamw;

pub use adamw::{is_trainable, AdamWOptimizer};

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Perform optimization step
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Get current step count
    fn step_count(&self) -> usize;

    /// Optimizer state as named tensors for checkpointing
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    /// Restore optimizer state from named checkpoint tensors
    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()>;
}
