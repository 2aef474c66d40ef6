//! Bidirectional LSTM sequence encoder

use candle_core::{Tensor, D};
use candle_nn::rnn::{Direction, LSTMConfig, LSTM, RNN};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};

/// Hidden size of each LSTM direction
pub const HIDDEN_SIZE: usize = 256;

/// Number of stacked bidirectional layers
pub const NUM_LAYERS: usize = 2;

/// Number of valid timesteps per example.
///
/// Every example in a batch is given the full sequence length of the feature
/// extractor, regardless of how much of the image actually holds text. This
/// ignores right padding in short images and may cost some accuracy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLengths(Vec<usize>);

impl SequenceLengths {
    /// `batch_size` entries all equal to `max_char_count`
    pub fn uniform(batch_size: usize, max_char_count: usize) -> Self {
        Self(vec![max_char_count; batch_size])
    }

    /// Explicit per-example lengths
    pub fn from_vec(lengths: Vec<usize>) -> Self {
        Self(lengths)
    }

    /// Lengths as a slice
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no examples
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every entry equals `steps`
    pub fn is_uniform(&self, steps: usize) -> bool {
        self.0.iter().all(|&len| len == steps)
    }

    /// Check one entry per example, each within `1..=max_steps`
    pub fn validate(&self, batch_size: usize, max_steps: usize) -> Result<()> {
        if self.0.len() != batch_size {
            return Err(Error::shape_mismatch(format!(
                "{} sequence lengths given for a batch of {}",
                self.0.len(),
                batch_size
            )));
        }
        if let Some(&len) = self.0.iter().find(|&&len| len == 0 || len > max_steps) {
            return Err(Error::shape_mismatch(format!(
                "Sequence length {len} is outside 1..={max_steps}"
            )));
        }
        Ok(())
    }
}

/// One bidirectional layer: a forward LSTM and a backward LSTM whose outputs
/// are concatenated per timestep.
struct BiLstmLayer {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstmLayer {
    fn new(input_dim: usize, layer_idx: usize, vb: &VarBuilder) -> Result<Self> {
        let forward = candle_nn::rnn::lstm(
            input_dim,
            HIDDEN_SIZE,
            LSTMConfig {
                layer_idx,
                direction: Direction::Forward,
                ..Default::default()
            },
            vb.clone(),
        )?;
        let backward = candle_nn::rnn::lstm(
            input_dim,
            HIDDEN_SIZE,
            LSTMConfig {
                layer_idx,
                direction: Direction::Backward,
                ..Default::default()
            },
            vb.clone(),
        )?;
        Ok(Self { forward, backward })
    }

    fn forward(&self, xs: &Tensor, reversed: &Tensor) -> Result<Tensor> {
        let states = self.forward.seq(xs)?;
        let ahead = self.forward.states_to_tensor(&states)?;

        let flipped = xs.index_select(reversed, 1)?;
        let states = self.backward.seq(&flipped)?;
        let behind = self
            .backward
            .states_to_tensor(&states)?
            .index_select(reversed, 1)?;

        Ok(Tensor::cat(&[ahead, behind], D::Minus1)?)
    }
}

/// Two stacked bidirectional LSTM layers, `[batch, steps, in] -> [batch, steps, 512]`
pub struct SequenceEncoder {
    layers: Vec<BiLstmLayer>,
}

impl SequenceEncoder {
    /// Build the encoder for `input_dim`-dimensional inputs
    pub fn new(input_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        let mut dim = input_dim;
        for layer_idx in 0..NUM_LAYERS {
            layers.push(BiLstmLayer::new(dim, layer_idx, &vb)?);
            dim = 2 * HIDDEN_SIZE;
        }
        Ok(Self { layers })
    }

    /// Output dimension per timestep
    pub fn output_dim(&self) -> usize {
        2 * HIDDEN_SIZE
    }

    /// Encode a batch-major sequence.
    ///
    /// Only full-length sequences are supported: every entry of `lengths`
    /// must equal the number of timesteps in `xs`.
    pub fn forward(&self, xs: &Tensor, lengths: &SequenceLengths) -> Result<Tensor> {
        let (batch, steps, _) = xs.dims3()?;
        lengths.validate(batch, steps)?;
        if !lengths.is_uniform(steps) {
            return Err(Error::shape_mismatch(format!(
                "The encoder runs every example for all {steps} timesteps, got lengths {:?}",
                lengths.as_slice()
            )));
        }

        let order: Vec<u32> = (0..steps as u32).rev().collect();
        let reversed = Tensor::new(order.as_slice(), xs.device())?;

        let mut hidden = xs.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &reversed)?;
        }
        Ok(hidden)
    }
}
