//! AdamW optimizer implementation
//!
//! Adam with optional decoupled weight decay. With a weight decay of zero this
//! is plain Adam. Moment estimates are kept per parameter name so they can be
//! written to and restored from checkpoints alongside the parameters.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, warn};

use super::Optimizer;
use crate::error::{Error, Result};
use crate::training::config::OptimizerConfig;

const STEP_KEY: &str = "adam.step";
const MOMENTUM_PREFIX: &str = "adam.m.";
const VARIANCE_PREFIX: &str = "adam.v.";

/// Whether a variable is optimized; batch-norm running statistics are not.
pub fn is_trainable(name: &str) -> bool {
    !(name.ends_with("running_mean") || name.ends_with("running_var"))
}

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Variable map containing parameters
    var_map: VarMap,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First moment estimates (momentum)
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates (RMSprop)
    variance: HashMap<String, Tensor>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer
    pub fn new(
        var_map: &VarMap,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        Ok(Self {
            var_map: var_map.clone(),
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        })
    }

    /// Create an optimizer from configuration
    pub fn from_config(var_map: &VarMap, config: &OptimizerConfig) -> Result<Self> {
        Self::new(
            var_map,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )
    }

    /// Trainable variables sorted by name
    fn trainable_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("Parameter map lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| is_trainable(name))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Apply AdamW update to a parameter
    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let param = var.as_tensor();
        let grad = grad.to_dtype(param.dtype())?;

        let (momentum, variance) = match (self.momentum.get(name), self.variance.get(name)) {
            (Some(m), Some(v)) => (m.clone(), v.clone()),
            _ => {
                let zeros = param.zeros_like()?;
                (zeros.clone(), zeros)
            }
        };

        // m_t = β₁ * m_{t-1} + (1 - β₁) * g_t
        let momentum = ((momentum * self.beta1)? + (&grad * (1.0 - self.beta1))?)?.detach();
        // v_t = β₂ * v_{t-1} + (1 - β₂) * g_t²
        let variance = ((variance * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?.detach();

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let corrected_momentum = (&momentum / bias_correction1)?;
        let corrected_variance = (&variance / bias_correction2)?;
        let update = corrected_momentum.div(&(corrected_variance.sqrt()? + self.epsilon)?)?;

        // θ_t = θ_{t-1} - α * (m̂_t / (√v̂_t + ε) + λ * θ_{t-1})
        let mut next = (param - (update * self.learning_rate)?)?;
        if self.weight_decay > 0.0 {
            next = (next - (param * (self.learning_rate * self.weight_decay))?)?;
        }
        var.set(&next.detach())?;

        self.momentum.insert(name.to_string(), momentum);
        self.variance.insert(name.to_string(), variance);
        Ok(())
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        if self.weight_decay > 0.0 {
            "adamw"
        } else {
            "adam"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;

        let mut updated = 0;
        for (name, var) in self.trainable_vars()? {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                self.update_parameter(&name, &var, grad)?;
                updated += 1;
            }
        }

        debug!("Optimizer step {} updated {} parameters", self.step_count, updated);
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let device = match self.momentum.values().next() {
            Some(tensor) => tensor.device().clone(),
            None => candle_core::Device::Cpu,
        };

        let mut state = HashMap::with_capacity(2 * self.momentum.len() + 1);
        let step = u32::try_from(self.step_count)
            .map_err(|_| Error::internal("Optimizer step count overflows u32"))?;
        state.insert(STEP_KEY.to_string(), Tensor::new(&[step], &device)?);
        for (name, tensor) in &self.momentum {
            state.insert(format!("{MOMENTUM_PREFIX}{name}"), tensor.clone());
        }
        for (name, tensor) in &self.variance {
            state.insert(format!("{VARIANCE_PREFIX}{name}"), tensor.clone());
        }
        Ok(state)
    }

    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let Some(step) = tensors.get(STEP_KEY) else {
            warn!("Checkpoint carries no optimizer state; moment estimates start fresh");
            self.momentum.clear();
            self.variance.clear();
            self.step_count = 0;
            return Ok(());
        };
        let step = step.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let step_count = step.first().copied().unwrap_or(0) as usize;

        let mut momentum = HashMap::new();
        let mut variance = HashMap::new();
        for (name, var) in self.trainable_vars()? {
            let m = tensors.get(&format!("{MOMENTUM_PREFIX}{name}"));
            let v = tensors.get(&format!("{VARIANCE_PREFIX}{name}"));
            if let (Some(m), Some(v)) = (m, v) {
                if m.dims() != var.dims() || v.dims() != var.dims() {
                    return Err(Error::checkpoint(format!(
                        "Optimizer state for '{name}' has shape {:?}, parameter has {:?}",
                        m.dims(),
                        var.dims()
                    )));
                }
                let device = var.device();
                momentum.insert(name.clone(), m.to_device(device)?.to_dtype(var.dtype())?);
                variance.insert(name, v.to_device(device)?.to_dtype(var.dtype())?);
            }
        }
        self.momentum = momentum;
        self.variance = variance;
        self.step_count = step_count;
        Ok(())
    }
}
