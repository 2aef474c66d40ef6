//! Convolutional feature extractor
//!
//! Seven convolution stages turn a `[batch, width, 32, 1]` image batch into a
//! left-to-right sequence of 512-dimensional feature vectors. The pooling
//! schedule halves the height four times and the width twice, so the final
//! `2x2` valid convolution leaves a feature map of height exactly one.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};
use tracing::debug;

use crate::config::BatchNormMode;
use crate::error::{Error, Result};

/// Fixed input image height
pub const IMAGE_HEIGHT: usize = 32;

/// Number of input channels (grayscale)
pub const IMAGE_CHANNELS: usize = 1;

/// Dimension of every feature vector in the output sequence
pub const FEATURE_DIM: usize = 512;

/// Pooling applied at the end of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    None,
    /// 2x2 window, stride 2 in both directions, no padding
    Halve,
    /// 2x2 window, stride 2 in height and 1 in width, padded like "same"
    HalveHeight,
}

#[derive(Debug, Clone, Copy)]
struct Stage {
    filters: usize,
    kernel: usize,
    padding: usize,
    norm: bool,
    pool: Pool,
}

const STAGES: [Stage; 7] = [
    Stage { filters: 64, kernel: 3, padding: 1, norm: false, pool: Pool::Halve },
    Stage { filters: 128, kernel: 3, padding: 1, norm: false, pool: Pool::Halve },
    Stage { filters: 256, kernel: 3, padding: 1, norm: true, pool: Pool::None },
    Stage { filters: 256, kernel: 3, padding: 1, norm: false, pool: Pool::HalveHeight },
    Stage { filters: 512, kernel: 3, padding: 1, norm: true, pool: Pool::None },
    Stage { filters: 512, kernel: 3, padding: 1, norm: false, pool: Pool::HalveHeight },
    Stage { filters: FEATURE_DIM, kernel: 2, padding: 0, norm: false, pool: Pool::None },
];

/// Length of the feature sequence produced for images of the given width.
///
/// Two stride-2 pools floor the width twice, the height-only pools keep it,
/// and the final `2x2` valid convolution removes one column:
/// `floor(floor(width / 2) / 2) - 1`. Widths below 8 leave no column and are
/// rejected.
pub fn sequence_length_for_width(width: usize) -> Result<usize> {
    let pooled = (width / 2) / 2;
    if pooled < 2 {
        return Err(Error::shape_mismatch(format!(
            "Image width {width} is too narrow; at least 8 columns are needed for one timestep"
        )));
    }
    Ok(pooled - 1)
}

/// Padding `(before, after)` that makes a pooling window behave like
/// "same" padding: the output has `ceil(input / stride)` cells.
fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = input.div_ceil(stride);
    let needed = ((output.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    let before = needed / 2;
    (before, needed - before)
}

/// 2x2 max pool with "same" padding, stride 2 over height and 1 over width.
///
/// Padding replicates edge cells, which can never exceed the real maximum of a
/// window they belong to. The overlapping width pairs are reduced with an
/// element-wise maximum, leaving a `2x1` pool whose window equals its stride.
fn pool_height_same(x: &Tensor) -> Result<Tensor> {
    let (_, _, height, width) = x.dims4()?;
    let (top, bottom) = same_padding(height, 2, 2);
    let (left, right) = same_padding(width, 2, 1);

    let mut padded = x.clone();
    if top + bottom > 0 {
        padded = padded.pad_with_same(2, top, bottom)?;
    }
    if left + right > 0 {
        padded = padded.pad_with_same(3, left, right)?;
    }
    let pairs = padded
        .narrow(3, 0, width)?
        .maximum(&padded.narrow(3, 1, width)?)?;
    Ok(pairs.max_pool2d_with_stride((2, 1), (2, 1))?)
}

/// Check that a `[batch, features, height, steps]` map collapsed to height 1
/// with the expected feature and step counts, and flatten it to
/// `[batch, steps, features]`.
fn collapse_to_sequence(x: &Tensor, expected_steps: usize) -> Result<Tensor> {
    let (_, features, out_height, steps) = x.dims4()?;
    if out_height != 1 || features != FEATURE_DIM {
        return Err(Error::shape_mismatch(format!(
            "Feature map must collapse to height 1 with {FEATURE_DIM} channels, got height {out_height} with {features}"
        )));
    }
    if steps != expected_steps {
        return Err(Error::shape_mismatch(format!(
            "Feature map has {steps} columns, expected {expected_steps}"
        )));
    }
    Ok(x.squeeze(2)?.transpose(1, 2)?.contiguous()?)
}

struct ConvStage {
    conv: Conv2d,
    norm: Option<BatchNorm>,
    pool: Pool,
}

/// Convolutional feature extractor
pub struct FeatureExtractor {
    stages: Vec<ConvStage>,
    batch_norm: BatchNormMode,
    max_image_width: usize,
    sequence_length: usize,
}

impl FeatureExtractor {
    /// Build the convolution stack for images of `max_image_width` columns.
    pub fn new(max_image_width: usize, batch_norm: BatchNormMode, vb: VarBuilder) -> Result<Self> {
        let sequence_length = sequence_length_for_width(max_image_width)?;

        let mut stages = Vec::with_capacity(STAGES.len());
        let mut in_channels = IMAGE_CHANNELS;
        for (i, stage) in STAGES.iter().enumerate() {
            let conv_config = Conv2dConfig {
                padding: stage.padding,
                ..Default::default()
            };
            let conv = candle_nn::conv2d(
                in_channels,
                stage.filters,
                stage.kernel,
                conv_config,
                vb.pp(format!("conv{}", i + 1)),
            )?;

            let norm = if stage.norm {
                let norm_config = BatchNormConfig {
                    eps: 1e-3,
                    momentum: 0.01,
                    ..Default::default()
                };
                Some(candle_nn::batch_norm(
                    stage.filters,
                    norm_config,
                    vb.pp(format!("norm{}", i + 1)),
                )?)
            } else {
                None
            };

            stages.push(ConvStage { conv, norm, pool: stage.pool });
            in_channels = stage.filters;
        }

        debug!(
            "Feature extractor built for width {} ({} timesteps)",
            max_image_width, sequence_length
        );

        Ok(Self {
            stages,
            batch_norm,
            max_image_width,
            sequence_length,
        })
    }

    /// Number of timesteps produced per image
    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Configured image width
    pub fn max_image_width(&self) -> usize {
        self.max_image_width
    }

    /// Run the stack on a `[batch, width, 32, 1]` batch.
    ///
    /// Returns `[batch, timesteps, 512]`.
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let (_, width, height, channels) = images.dims4().map_err(|_| {
            Error::shape_mismatch(format!(
                "Expected a [batch, width, height, channels] image batch, got {:?}",
                images.dims()
            ))
        })?;
        if width != self.max_image_width || height != IMAGE_HEIGHT || channels != IMAGE_CHANNELS {
            return Err(Error::shape_mismatch(format!(
                "Expected images of {}x{}x{}, got {}x{}x{}",
                self.max_image_width, IMAGE_HEIGHT, IMAGE_CHANNELS, width, height, channels
            )));
        }

        let use_batch_stats = train && self.batch_norm == BatchNormMode::Batch;

        // [B, W, H, C] -> [B, C, H, W]
        let mut x = images.permute((0, 3, 2, 1))?.contiguous()?;
        for stage in &self.stages {
            x = stage.conv.forward(&x)?.relu()?;
            if let Some(norm) = &stage.norm {
                x = norm.forward_t(&x, use_batch_stats)?;
            }
            x = match stage.pool {
                Pool::None => x,
                Pool::Halve => x.max_pool2d_with_stride((2, 2), (2, 2))?,
                Pool::HalveHeight => pool_height_same(&x)?,
            };
        }

        collapse_to_sequence(&x, self.sequence_length)
    }
}
