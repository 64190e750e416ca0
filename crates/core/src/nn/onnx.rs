//! [`Network`] over an ONNX Runtime session.
//!
//! Handles both FP32 graphs and FP16 graphs; FP16 inputs are converted on the
//! way in and outputs widened back to `f32` on the way out.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, warn};

use super::Network;
use crate::device::Device;

pub struct OnnxNetwork {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    label: String,
}

impl OnnxNetwork {
    /// Build a session for `path` on `device`.
    ///
    /// Callers must have confirmed the ONNX Runtime library is loadable
    /// (see [`crate::runtime::onnx_runtime`]).
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        let session = build_session(path, device)?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("ONNX model declares no inputs")?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("ONNX model declares no outputs")?;
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
            label,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }
}

fn build_session(path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let builder = match device {
        Device::Cuda => {
            if !CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
            {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(device = %device, "Building session with CUDA EP");
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])?
        }
        Device::Cpu => {
            debug!(device = %device, "Building session with CPU EP");
            builder
        }
    };

    builder
        .commit_from_file(path)
        .with_context(|| format!("Failed to load ONNX model: {}", path.display()))
}

impl Network for OnnxNetwork {
    fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;

        let output = if self.is_fp16 {
            run_fp16(&mut session, input, &self.input_name, &self.output_name)?
        } else {
            let input_tensor = Tensor::from_array(input.clone())?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            outputs[self.output_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned()
        };

        output
            .into_dimensionality::<Ix4>()
            .context("ONNX model output is not NCHW")
    }

    fn name(&self) -> &str {
        &self.label
    }
}

fn run_fp16(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let shape = output_view.shape().to_vec();
    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(shape, f32_data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires ONNX Runtime + model file.
    #[test]
    #[ignore]
    fn test_onnx_network_loads_realesrgan() {
        let path = Path::new("models/RealESRGAN_x4plus_anime_6B.onnx");
        let network = OnnxNetwork::load(path, Device::Cpu).unwrap();
        let input = Array4::<f32>::zeros((1, 3, 16, 16));
        let output = network.forward(&input).unwrap();
        assert_eq!(output.shape(), &[1, 3, 64, 64]);
    }
}
