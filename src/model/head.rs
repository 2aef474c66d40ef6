//! Per-timestep linear classifier

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::engine::Engine;
use crate::error::{Error, Result};

const INIT_STDDEV: f32 = 0.1;

/// Draw `count` values from a normal distribution truncated at two standard
/// deviations, redrawing anything outside.
fn truncated_normal(count: usize, stddev: f32, seed: u64) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0f32, stddev)
        .map_err(|e| Error::internal(format!("Invalid initializer: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let bound = 2.0 * stddev;

    let values = (0..count)
        .map(|_| loop {
            let v = normal.sample(&mut rng);
            if v.abs() <= bound {
                break v;
            }
        })
        .collect();
    Ok(values)
}

/// Shared linear map from encoder features to class scores
pub struct ClassifierHead {
    weight: Tensor,
    bias: Tensor,
    num_classes: usize,
}

impl ClassifierHead {
    /// Register `head.weight` `[input_dim, num_classes]` and `head.bias` in the
    /// engine. The weight starts from a truncated normal seeded with `seed`,
    /// the bias at zero.
    pub fn new(input_dim: usize, num_classes: usize, seed: u64, engine: &Engine) -> Result<Self> {
        let vb = engine.var_builder().pp("head");
        let weight = vb.get_with_hints((input_dim, num_classes), "weight", candle_nn::init::ZERO)?;
        let bias = vb.get_with_hints(num_classes, "bias", candle_nn::init::ZERO)?;

        let init = Tensor::from_vec(
            truncated_normal(input_dim * num_classes, INIT_STDDEV, seed)?,
            (input_dim, num_classes),
            engine.device(),
        )?
        .to_dtype(engine.dtype())?;
        let mut var_map = engine.var_map().clone();
        var_map.set_one("head.weight", init)?;

        Ok(Self {
            weight,
            bias,
            num_classes,
        })
    }

    /// Number of output classes, blank included
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Project `[batch, steps, dim]` features to time-major logits
    /// `[steps, batch, num_classes]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, dim) = xs.dims3()?;
        let (expected, _) = self.weight.dims2()?;
        if dim != expected {
            return Err(Error::shape_mismatch(format!(
                "Classifier expects {expected}-dimensional features, got {dim}"
            )));
        }
        let logits = xs
            .broadcast_matmul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(logits.transpose(0, 1)?.contiguous()?)
    }
}
