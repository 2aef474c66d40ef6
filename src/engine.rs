//! Numeric execution context
//!
//! An [`Engine`] owns the device every tensor lives on and the variable map
//! holding every learnable parameter and normalization statistic. The model
//! holds its engine for its whole lifetime; checkpointing and optimization
//! reach the parameters through it.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array4;
use tracing::info;

use crate::config::DeviceKind;
use crate::error::Result;

/// Device, parameter storage and working precision for one model
pub struct Engine {
    device: Device,
    var_map: VarMap,
    dtype: DType,
}

impl Engine {
    /// Open an engine on the requested device
    pub fn open(kind: DeviceKind) -> Result<Self> {
        let device = match kind {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::new_cuda(0)?,
            DeviceKind::Metal => Device::new_metal(0)?,
        };
        info!("Opened engine on {:?}", device);
        Ok(Self::with_device(device))
    }

    /// Wrap an existing device with an empty parameter map
    pub fn with_device(device: Device) -> Self {
        Self {
            device,
            var_map: VarMap::new(),
            dtype: DType::F32,
        }
    }

    /// Device tensors are allocated on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter storage
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Working precision
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Variable builder registering new parameters in this engine
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.var_map, self.dtype, &self.device)
    }

    /// Copy a host image batch to the device
    pub fn upload(&self, images: &Array4<f32>) -> Result<Tensor> {
        let data: Vec<f32> = images.iter().copied().collect();
        Ok(Tensor::from_vec(data, images.dim(), &self.device)?)
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }

    /// Release the device and every parameter
    pub fn close(self) {
        info!("Closing engine on {:?}", self.device);
    }
}
