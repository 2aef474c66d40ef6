//! CRNN - convolutional recurrent text-line recognition with CTC training
//!
//! A fixed-height grayscale image of one line of text goes through a
//! convolutional feature extractor, a two-layer bidirectional LSTM and a
//! per-timestep classifier. Training minimizes the CTC loss; inference
//! decodes the per-timestep class scores with prefix beam search.
//!
//! ```rust,ignore
//! use crnn::{CrnnConfig, Recognizer};
//!
//! let mut config = CrnnConfig::default();
//! config.training.checkpointing.output_dir = Some("model".into());
//! config.data.examples_path = Some("examples".into());
//!
//! let mut recognizer = Recognizer::new(config)?;
//! let data = recognizer.load_data(0.70)?;
//! recognizer.train(&data)?;
//! recognizer.test(&data)?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod ctc;
pub mod data;
pub mod engine;
pub mod error;
pub mod model;
pub mod training;

// Re-exports
pub use config::{BatchNormMode, CrnnConfig, DataConfig, DecoderKind, DeviceKind, ModelConfig};
pub use data::{Batch, BatchSource, DataManager, DataManagerConfig, LabelCodec, SparseTarget};
pub use engine::Engine;
pub use error::{Error, Result};
pub use model::{Crnn, Geometry, SequenceLengths};
pub use training::{CrnnTrainer, EvaluationSummary, TrainingConfig, TrainingSummary};

use tracing::{debug, info, instrument};

/// Main recognition system: one model, its trainer and the configuration
/// they were built from
pub struct Recognizer {
    /// Trainer owning the model
    trainer: CrnnTrainer,
    /// System configuration
    config: CrnnConfig,
}

impl Recognizer {
    /// Build the engine, the model and the trainer, restoring the latest
    /// checkpoint when `training.checkpointing.restore` is set
    #[instrument(skip(config))]
    pub fn new(config: CrnnConfig) -> Result<Self> {
        info!("Initializing CRNN recognizer");
        config.validate()?;
        config.model_path()?;

        let engine = Engine::open(config.device)?;
        debug!("Engine opened");

        let model = Crnn::new(&config.model, engine)?;
        debug!("Model built with {} timesteps", model.max_char_count());

        let trainer = CrnnTrainer::new(model, config.training.clone())?;
        debug!("Trainer ready at step {}", trainer.step());

        Ok(Self { trainer, config })
    }

    /// Load the configured examples, splitting them at `train_test_ratio`
    pub fn load_data(&self, train_test_ratio: f64) -> Result<DataManager> {
        let model = self.trainer.model();
        let data_config = DataManagerConfig {
            examples_path: self.config.examples_path()?.to_path_buf(),
            batch_size: self.config.data.batch_size,
            train_test_ratio,
            max_image_width: self.config.model.max_image_width,
            max_char_count: model.max_char_count(),
        };
        DataManager::load(&data_config, model.codec())
    }

    /// Train for the configured number of iterations
    pub fn train(&mut self, source: &dyn BatchSource) -> Result<TrainingSummary> {
        self.trainer
            .train(source, self.config.training.iteration_count)
    }

    /// Decode every test batch
    pub fn test(&self, source: &dyn BatchSource) -> Result<EvaluationSummary> {
        self.trainer.test(source)
    }

    /// Current training step
    pub fn step(&self) -> usize {
        self.trainer.step()
    }

    /// Get the current configuration
    pub fn config(&self) -> &CrnnConfig {
        &self.config
    }

    /// Trainer owning the model
    pub fn trainer(&self) -> &CrnnTrainer {
        &self.trainer
    }

    /// The network
    pub fn model(&self) -> &Crnn {
        self.trainer.model()
    }

    /// Release the model and its engine
    pub fn close(self) {
        self.trainer.into_model().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognizer_requires_model_path() {
        let err = Recognizer::new(CrnnConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_recognizer_builds_from_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = CrnnConfig::default();
        config.model.alphabet = "ab".to_string();
        config.model.max_image_width = 16;
        config.training.checkpointing.output_dir = Some(temp_dir.path().join("model"));
        config.training.checkpointing.restore = true;

        let recognizer = Recognizer::new(config).unwrap();
        assert_eq!(recognizer.step(), 0);
        assert_eq!(recognizer.model().max_char_count(), 3);
        assert!(matches!(recognizer.load_data(0.7), Err(Error::Config(_))));
        recognizer.close();
    }
}
