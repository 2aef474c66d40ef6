//! The CRNN network: convolutional features, bidirectional LSTM encoder and a
//! per-timestep classifier, trained with CTC.
//!
//! Construction happens in two phases. The feature extractor is built first
//! and fixes `max_char_count`, the number of timesteps every image yields;
//! the encoder, the classifier and the loss are then built against that
//! fixed length.

pub mod cnn;
pub mod head;
pub mod rnn;

pub use cnn::{sequence_length_for_width, FeatureExtractor, FEATURE_DIM, IMAGE_HEIGHT};
pub use head::ClassifierHead;
pub use rnn::{SequenceEncoder, SequenceLengths};

use candle_core::Tensor;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ModelConfig;
use crate::ctc::{self, DecodedBatch};
use crate::data::{LabelCodec, SparseTarget};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Shape parameters a set of weights is only valid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Input image width
    pub max_image_width: usize,
    /// Output classes including the blank
    pub num_classes: usize,
    /// Timesteps per image
    pub max_char_count: usize,
}

/// Convolutional recurrent network with its execution engine
pub struct Crnn {
    engine: Engine,
    config: ModelConfig,
    codec: LabelCodec,
    features: FeatureExtractor,
    encoder: SequenceEncoder,
    head: ClassifierHead,
    max_char_count: usize,
}

impl Crnn {
    /// Build the network, registering every parameter in `engine`
    pub fn new(config: &ModelConfig, engine: Engine) -> Result<Self> {
        config.validate()?;
        let codec = LabelCodec::new(&config.alphabet)?;
        let vb = engine.var_builder();

        let features =
            FeatureExtractor::new(config.max_image_width, config.batch_norm, vb.pp("cnn"))?;
        let max_char_count = features.sequence_length();

        let encoder = SequenceEncoder::new(FEATURE_DIM, vb.pp("encoder"))?;
        let head = ClassifierHead::new(
            encoder.output_dim(),
            codec.num_classes(),
            config.seed,
            &engine,
        )?;

        info!(
            "Built CRNN: width {}, {} timesteps, {} classes, {} parameters",
            config.max_image_width,
            max_char_count,
            codec.num_classes(),
            engine.parameter_count()
        );

        Ok(Self {
            engine,
            config: config.clone(),
            codec,
            features,
            encoder,
            head,
            max_char_count,
        })
    }

    /// Timesteps produced per image
    pub fn max_char_count(&self) -> usize {
        self.max_char_count
    }

    /// Output classes including the blank
    pub fn num_classes(&self) -> usize {
        self.codec.num_classes()
    }

    /// Shape parameters of this network
    pub fn geometry(&self) -> Geometry {
        Geometry {
            max_image_width: self.config.max_image_width,
            num_classes: self.num_classes(),
            max_char_count: self.max_char_count,
        }
    }

    /// Label codec for the configured alphabet
    pub fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    /// Model configuration
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Execution engine holding the parameters
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// One full-length entry per example
    pub fn sequence_lengths(&self, batch_size: usize) -> SequenceLengths {
        SequenceLengths::uniform(batch_size, self.max_char_count)
    }

    /// Logits `[max_char_count, batch, num_classes]` for a host image batch
    pub fn forward(&self, images: &Array4<f32>, train: bool) -> Result<Tensor> {
        let images = self.engine.upload(images)?;
        self.forward_tensor(&images, train)
    }

    /// Logits for an image batch already on the engine's device
    pub fn forward_tensor(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.features.forward(images, train)?;
        let (batch, _, _) = features.dims3()?;
        let encoded = self
            .encoder
            .forward(&features, &self.sequence_lengths(batch))?;
        self.head.forward(&encoded)
    }

    /// Mean CTC loss of `logits` against `targets`
    pub fn loss(
        &self,
        logits: &Tensor,
        targets: &SparseTarget,
        lengths: &SequenceLengths,
    ) -> Result<Tensor> {
        let (_, batch, _) = logits.dims3()?;
        if targets.rows() != batch {
            return Err(Error::shape_mismatch(format!(
                "{} targets for a batch of {batch}",
                targets.rows()
            )));
        }
        lengths.validate(batch, self.max_char_count)?;
        ctc::ctc_loss(
            logits,
            &targets.sequences(),
            lengths.as_slice(),
            self.codec.blank(),
        )
    }

    /// Decode logits with the configured strategy
    pub fn decode(&self, logits: &Tensor, lengths: &SequenceLengths) -> Result<DecodedBatch> {
        let (_, batch, _) = logits.dims3()?;
        lengths.validate(batch, self.max_char_count)?;
        ctc::decode(
            logits,
            lengths.as_slice(),
            self.codec.blank(),
            self.config.decoder,
        )
    }

    /// Mean normalized edit distance between decoded and target sequences
    pub fn edit_distance(&self, decoded: &DecodedBatch, targets: &SparseTarget) -> f64 {
        ctc::mean_edit_distance(decoded.sequences(), &targets.sequences())
    }

    /// Release the engine
    pub fn close(self) {
        self.engine.close();
    }
}
