//! Compute device selection.

use std::str::FromStr;

use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use tracing::{debug, warn};

use crate::error::SrError;
use crate::runtime;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl Device {
    /// Use `explicit` verbatim, otherwise probe for a CUDA-capable runtime
    /// and fall back to CPU. Never fails.
    pub fn resolve(explicit: Option<Device>) -> Device {
        if let Some(device) = explicit {
            debug!(device = %device, "Using explicitly requested device");
            return device;
        }

        let device = if cuda_available() {
            Device::Cuda
        } else {
            Device::Cpu
        };
        debug!(device = %device, "Resolved compute device");
        device
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Cuda)
    }

    /// Placement for candle tensors.
    ///
    /// CUDA needs the crate's `cuda` feature and a visible GPU. When either is
    /// missing the native network runs on the CPU and the fallback is logged.
    pub fn candle_device(&self) -> candle_core::Device {
        match self {
            Self::Cpu => candle_core::Device::Cpu,
            Self::Cuda => match candle_core::Device::new_cuda(0) {
                Ok(device) => device,
                Err(error) => {
                    warn!(
                        error = %error,
                        "CUDA requested but unavailable to the native network; using CPU"
                    );
                    candle_core::Device::Cpu
                }
            },
        }
    }
}

fn cuda_available() -> bool {
    if runtime::onnx_runtime().is_err() {
        return false;
    }
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

impl FromStr for Device {
    type Err = SrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(SrError::invalid(format!(
                "unknown device '{other}' (expected 'cpu' or 'cuda')"
            ))),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}
