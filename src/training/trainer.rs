//! Training controller for CRNN models
//!
//! The [`CrnnTrainer`] owns the model, the optimizer, the checkpoint manager
//! and the step counter. It runs the training loop, the test pass, and the
//! construction-time restore.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::data::{Batch, BatchSource};
use crate::error::{Error, Result};
use crate::model::Crnn;
use crate::training::checkpoints::CheckpointManager;
use crate::training::config::{CheckpointPolicy, TrainingConfig};
use crate::training::optimizers::{AdamWOptimizer, Optimizer};

/// Main trainer for CRNN models
pub struct CrnnTrainer {
    /// Training configuration
    config: TrainingConfig,

    /// Model being trained
    model: Crnn,

    /// Optimizer state
    optimizer: AdamWOptimizer,

    /// Checkpoint manager
    checkpoint_manager: CheckpointManager,

    /// Training state
    state: TrainingState,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Step counter; one step is one full pass over the training batches
    pub step: usize,

    /// Batches trained on by this trainer
    pub batches_seen: usize,

    /// Training status
    pub status: TrainingStatus,

    /// Summed loss of every completed step
    pub loss_history: Vec<f64>,
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    /// No training call yet
    NotStarted,
    /// Inside [`CrnnTrainer::train`]
    Running,
    /// Last training call finished
    Completed,
    /// Last training call failed
    Failed {
        /// Error message
        error: String,
    },
}

/// Loss of one completed step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationLoss {
    /// Step the loss was accumulated at
    pub step: usize,
    /// Sum of the mean batch losses over the step
    pub loss: f64,
}

/// Result of [`CrnnTrainer::train`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Loss per completed step
    pub iterations: Vec<IterationLoss>,
    /// Batches trained on
    pub batches: usize,
    /// Step counter after training
    pub final_step: usize,
}

/// Ground truth next to the decoded text for one example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Label of the example
    pub ground_truth: String,
    /// Decoded text
    pub decoded: String,
}

/// Result of [`CrnnTrainer::test`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    /// Examples decoded
    pub examples: usize,
    /// Mean normalized edit distance against the targets
    pub mean_edit_distance: f64,
    /// Examples decoded exactly
    pub exact_matches: usize,
    /// Every transcript, in batch order
    pub transcripts: Vec<Transcript>,
}

impl CrnnTrainer {
    /// Create a trainer, restoring the latest checkpoint if configured
    pub fn new(model: Crnn, config: TrainingConfig) -> Result<Self> {
        config.validate()?;

        let checkpoint_dir = config
            .checkpointing
            .output_dir
            .clone()
            .ok_or_else(|| Error::config("A model path (checkpoint directory) is required"))?;
        let checkpoint_manager =
            CheckpointManager::new(checkpoint_dir, config.checkpointing.save_total_limit)?;

        let optimizer = AdamWOptimizer::from_config(model.engine().var_map(), &config.optimizer)?;
        info!(
            "Optimizer {} at learning rate {}",
            optimizer.name(),
            optimizer.learning_rate()
        );

        let mut trainer = Self {
            config,
            model,
            optimizer,
            checkpoint_manager,
            state: TrainingState::new(),
        };

        if trainer.config.checkpointing.restore {
            trainer.restore()?;
        }

        Ok(trainer)
    }

    /// Current step
    pub fn step(&self) -> usize {
        self.state.step
    }

    /// Training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Model being trained
    pub fn model(&self) -> &Crnn {
        &self.model
    }

    /// Give the model back, dropping optimizer state
    pub fn into_model(self) -> Crnn {
        self.model
    }

    /// Optimizer
    pub fn optimizer(&self) -> &AdamWOptimizer {
        &self.optimizer
    }

    /// Checkpoint manager
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// Every model variable sorted by name
    fn model_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .model
            .engine()
            .var_map()
            .data()
            .lock()
            .map_err(|_| Error::internal("Parameter map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Load the latest checkpoint, if there is one.
    ///
    /// Returns `false` and keeps the fresh parameters and step 0 when the
    /// checkpoint directory holds nothing. Parameters are only touched once
    /// the whole checkpoint has been validated.
    #[instrument(skip(self))]
    pub fn restore(&mut self) -> Result<bool> {
        info!("Restoring");
        let Some(latest) = self.checkpoint_manager.latest()? else {
            info!(
                "No checkpoint under {}; starting from step 0",
                self.checkpoint_manager.checkpoint_dir().display()
            );
            return Ok(false);
        };

        let geometry = self.model.geometry();
        if let Some(saved) = latest.geometry {
            if saved != geometry {
                return Err(Error::checkpoint(format!(
                    "Checkpoint {} was saved for {:?}, model is {:?}",
                    latest.path.display(),
                    saved,
                    geometry
                )));
            }
        }

        let vars = self.model_vars()?;
        let expected: Vec<(String, Vec<usize>)> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect();
        let tensors = self.checkpoint_manager.load(
            &latest.path,
            &expected,
            self.model.engine().device(),
        )?;

        let mut values = Vec::with_capacity(vars.len());
        for (name, var) in &vars {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| Error::checkpoint(format!("Checkpoint lost tensor '{name}'")))?;
            values.push(tensor.to_dtype(var.dtype())?);
        }
        self.optimizer.load_state_tensors(&tensors)?;
        for ((_, var), value) in vars.iter().zip(&values) {
            var.set(value)?;
        }

        self.state.step = latest.step;
        info!(
            "Checkpoint {} is valid; resuming at step {}",
            latest.path.display(),
            latest.step
        );
        Ok(true)
    }

    /// Persist parameters and optimizer state tagged with the current step
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let mut tensors: HashMap<String, Tensor> = self
            .model_vars()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        tensors.extend(self.optimizer.state_tensors()?);
        self.checkpoint_manager
            .save(self.state.step, self.model.geometry(), &tensors)
    }

    /// One optimizer step on `batch`; returns the batch's mean loss.
    ///
    /// With `display` set, prints the first example's ground truth and its
    /// decoding from the logits computed before the update.
    pub fn train_batch(&mut self, batch: &Batch, display: bool) -> Result<f64> {
        check_batch(batch)?;

        let logits = self.model.forward(&batch.images, true)?;
        let lengths = self.model.sequence_lengths(batch.len());
        let loss = self.model.loss(&logits, &batch.targets, &lengths)?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;

        let loss_value = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);

        if display {
            let decoded = self.model.decode(&logits.detach(), &lengths)?;
            if let (Some(truth), Some(hypothesis)) =
                (batch.ground_truth.first(), decoded.sequences().first())
            {
                println!("{truth}");
                println!("{}", self.model.codec().decode_indices(hypothesis));
            }
        }

        self.state.batches_seen += 1;
        debug!("Step {} batch loss {:.4}", self.state.step, loss_value);
        Ok(loss_value)
    }

    /// Train for `iteration_count` steps starting at the current step.
    ///
    /// Every step is one pass over the source's training batches. A checkpoint
    /// tagged with the current step is written after every batch (or after
    /// every pass, depending on the checkpoint policy). A failed write stops
    /// training; the optimizer update of that batch is kept in memory, so the
    /// parameters are then one batch ahead of the disk.
    #[instrument(skip(self, source))]
    pub fn train(
        &mut self,
        source: &dyn BatchSource,
        iteration_count: usize,
    ) -> Result<TrainingSummary> {
        info!("Training");
        self.state.status = TrainingStatus::Running;

        match self.run_iterations(source, iteration_count) {
            Ok(summary) => {
                self.state.status = TrainingStatus::Completed;
                info!(
                    "Training finished at step {} after {} batches",
                    summary.final_step, summary.batches
                );
                Ok(summary)
            }
            Err(e) => {
                self.state.status = TrainingStatus::Failed {
                    error: e.to_string(),
                };
                Err(e)
            }
        }
    }

    fn run_iterations(
        &mut self,
        source: &dyn BatchSource,
        iteration_count: usize,
    ) -> Result<TrainingSummary> {
        let batches = source.train_batches();
        if batches.is_empty() {
            return Err(Error::config(
                "No training batches; check the examples path, batch size and train/test ratio",
            ));
        }

        let start = self.state.step;
        let mut iterations = Vec::with_capacity(iteration_count);
        let mut batch_count = 0;

        for i in start..start + iteration_count {
            let display = i % self.config.display_every == 0;
            let mut iteration_loss = 0.0;

            for batch in batches {
                iteration_loss += self.train_batch(batch, display)?;
                batch_count += 1;
                if self.config.checkpointing.policy == CheckpointPolicy::EveryBatch {
                    self.save_checkpoint()?;
                }
            }
            if self.config.checkpointing.policy == CheckpointPolicy::EveryIteration {
                self.save_checkpoint()?;
            }

            println!("[{}] Iteration loss: {}", self.state.step, iteration_loss);
            iterations.push(IterationLoss {
                step: self.state.step,
                loss: iteration_loss,
            });
            self.state.loss_history.push(iteration_loss);
            self.state.step += 1;
        }

        Ok(TrainingSummary {
            iterations,
            batches: batch_count,
            final_step: self.state.step,
        })
    }

    /// Decode every test batch and print ground truth against the decoding
    #[instrument(skip(self, source))]
    pub fn test(&self, source: &dyn BatchSource) -> Result<EvaluationSummary> {
        test_model(&self.model, source)
    }
}

/// Decode every test batch of `source` with `model`
pub fn test_model(model: &Crnn, source: &dyn BatchSource) -> Result<EvaluationSummary> {
    info!("Testing");
    let codec = model.codec();

    let mut transcripts = Vec::new();
    let mut total_distance = 0.0;
    let mut exact_matches = 0;

    for batch in source.test_batches() {
        if batch.is_empty() {
            continue;
        }
        let (images, ..) = batch.images.dim();
        let logits = model.forward(&batch.images, false)?;
        let decoded = model.decode(&logits, &model.sequence_lengths(images))?;
        let truths = batch.targets.sequences();
        total_distance += model.edit_distance(&decoded, &batch.targets) * decoded.len() as f64;

        for ((ground_truth, hypothesis), truth) in batch
            .ground_truth
            .iter()
            .zip(decoded.sequences())
            .zip(&truths)
        {
            let text = codec.decode_indices(hypothesis);
            println!("{ground_truth}");
            println!("{text}");

            if hypothesis == truth {
                exact_matches += 1;
            }
            transcripts.push(Transcript {
                ground_truth: ground_truth.clone(),
                decoded: text,
            });
        }
    }

    let examples = transcripts.len();
    let mean_edit_distance = if examples == 0 {
        0.0
    } else {
        total_distance / examples as f64
    };
    info!(
        "Tested {} examples: {} exact, mean edit distance {:.4}",
        examples, exact_matches, mean_edit_distance
    );

    Ok(EvaluationSummary {
        examples,
        mean_edit_distance,
        exact_matches,
        transcripts,
    })
}

fn check_batch(batch: &Batch) -> Result<()> {
    let (images, ..) = batch.images.dim();
    if images == 0 {
        return Err(Error::shape_mismatch("Empty training batch"));
    }
    if images != batch.ground_truth.len() || images != batch.targets.rows() {
        return Err(Error::shape_mismatch(format!(
            "Batch has {} images, {} labels and {} targets",
            images,
            batch.ground_truth.len(),
            batch.targets.rows()
        )));
    }
    Ok(())
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self {
            step: 0,
            batches_seen: 0,
            status: TrainingStatus::NotStarted,
            loss_history: Vec::new(),
        }
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_state_creation() {
        let state = TrainingState::new();
        assert_eq!(state.step, 0);
        assert_eq!(state.batches_seen, 0);
        assert_eq!(state.status, TrainingStatus::NotStarted);
        assert!(state.loss_history.is_empty());
    }
}
