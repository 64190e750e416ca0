//! Executable networks behind a single forward-pass seam.
//!
//! Two implementations exist: [`srresnet::SrResNet`], built with candle from
//! a parameter table, and [`onnx::OnnxNetwork`], which wraps an
//! `ort::Session`. The rest of the engine only sees [`Network`].

pub mod onnx;
pub mod srresnet;

use anyhow::Result;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// A forward pass over an NCHW `f32` batch.
///
/// Implementations must be callable through a shared reference; stateful
/// runtimes keep their own lock.
pub trait Network: Send + Sync {
    fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Numeric range the network consumes and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRange {
    /// 0.0–1.0 (SRResNet, Real-ESRGAN PyTorch exports)
    UnitInterval,
    /// 0.0–255.0 (some ONNX exports fold the normalisation into the graph)
    ByteRange,
}

impl ValueRange {
    pub fn max(&self) -> f32 {
        match self {
            Self::UnitInterval => 1.0,
            Self::ByteRange => 255.0,
        }
    }
}

/// How pixels must be laid out before they reach a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub channel_order: ChannelOrder,
    pub value_range: ValueRange,
    /// Spatial dimensions are reflection padded to a multiple of this before
    /// the forward pass and cropped afterwards. `1` disables padding.
    pub pad_align: usize,
}

impl Default for TensorLayout {
    fn default() -> Self {
        Self {
            channel_order: ChannelOrder::Rgb,
            value_range: ValueRange::UnitInterval,
            pad_align: 1,
        }
    }
}
