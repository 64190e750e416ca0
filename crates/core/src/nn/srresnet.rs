//! Native SRResNet built with candle from a parameter table.
//!
//! Layout (parameter name prefixes in brackets):
//! entry 9×9 conv + PReLU [`entry.0`, `entry.1`] → N residual blocks
//! [`body.{i}.conv1/bn1/prelu/conv2/bn2`] → 3×3 conv + BN [`mid_conv.0/1`]
//! plus the entry output → log2(scale) × (3×3 conv, PixelShuffle(2), PReLU)
//! [`upsample.{3k}`, `upsample.{3k+2}`] → 9×9 conv to RGB [`reconstruction`].

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, PReLU, VarBuilder};
use ndarray::Array4;
use tracing::debug;

use super::Network;

pub const DEFAULT_CHANNELS: usize = 64;
pub const DEFAULT_BLOCKS: usize = 16;
pub const DEFAULT_PRELU_SLOPE: f32 = 0.25;
const IMAGE_CHANNELS: usize = 3;
const OUTER_KERNEL: usize = 9;
const INNER_KERNEL: usize = 3;
const BATCH_NORM_EPS: f64 = 1e-5;

/// Parameter name → tensor, as read from the checkpoint.
pub type ParamTable = HashMap<String, Tensor>;

/// Keys that were absent from, or not consumed out of, a parameter table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Inference-mode batch norm. A layer the checkpoint omits is the identity.
struct EvalNorm(Option<BatchNorm>);

impl Module for EvalNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match &self.0 {
            Some(bn) => bn.forward_t(xs, false),
            None => Ok(xs.clone()),
        }
    }
}

struct ResidualBlock {
    conv1: Conv2d,
    bn1: EvalNorm,
    prelu: PReLU,
    conv2: Conv2d,
    bn2: EvalNorm,
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let t = xs
            .apply(&self.conv1)?
            .apply(&self.bn1)?
            .apply(&self.prelu)?
            .apply(&self.conv2)?
            .apply(&self.bn2)?;
        t + xs
    }
}

struct UpsampleStage {
    conv: Conv2d,
    prelu: PReLU,
}

pub struct SrResNet {
    entry_conv: Conv2d,
    entry_prelu: PReLU,
    body: Vec<ResidualBlock>,
    mid_conv: Conv2d,
    mid_bn: EvalNorm,
    upsample: Vec<UpsampleStage>,
    reconstruction: Conv2d,
    scale: u32,
    channels: usize,
    device: Device,
}

impl SrResNet {
    /// Build the network for `scale` (2, 4 or 8) from `params`, with every
    /// weight placed on `device`.
    ///
    /// Missing parameters keep a deterministic default (zero convolutions,
    /// identity batch norm, PReLU slope 0.25) and unused parameters are
    /// ignored; both are listed in the returned [`LoadReport`]. A parameter
    /// whose shape disagrees with the architecture is an error.
    pub fn from_params(params: ParamTable, scale: u32, device: &Device) -> Result<(Self, LoadReport)> {
        let stages = match scale {
            2 => 1,
            4 => 2,
            8 => 3,
            other => bail!("SRResNet supports scales 2, 4 and 8, got {other}"),
        };

        let channels = params
            .get("entry.0.weight")
            .and_then(|w| w.dims().first().copied())
            .unwrap_or(DEFAULT_CHANNELS);
        let blocks = count_body_blocks(&params).unwrap_or(DEFAULT_BLOCKS);
        debug!(channels, blocks, scale, device = ?device, "Building SRResNet");

        let shapes: HashMap<String, Vec<usize>> = params
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec()))
            .collect();
        let vb = VarBuilder::from_tensors(params, DType::F32, device);
        let mut reader = ParamReader::new(vb, shapes);

        let entry_conv = reader.conv("entry.0", IMAGE_CHANNELS, channels, OUTER_KERNEL)?;
        let entry_prelu = reader.prelu("entry.1", channels)?;

        let mut body = Vec::with_capacity(blocks);
        for i in 0..blocks {
            let prefix = format!("body.{i}");
            body.push(ResidualBlock {
                conv1: reader.conv(&format!("{prefix}.conv1"), channels, channels, INNER_KERNEL)?,
                bn1: reader.bn(&format!("{prefix}.bn1"), channels)?,
                prelu: reader.prelu(&format!("{prefix}.prelu"), channels)?,
                conv2: reader.conv(&format!("{prefix}.conv2"), channels, channels, INNER_KERNEL)?,
                bn2: reader.bn(&format!("{prefix}.bn2"), channels)?,
            });
        }

        let mid_conv = reader.conv("mid_conv.0", channels, channels, INNER_KERNEL)?;
        let mid_bn = reader.bn("mid_conv.1", channels)?;

        let mut upsample = Vec::with_capacity(stages);
        for stage in 0..stages {
            let conv = reader.conv(
                &format!("upsample.{}", stage * 3),
                channels,
                channels * 4,
                INNER_KERNEL,
            )?;
            let prelu = reader.prelu(&format!("upsample.{}", stage * 3 + 2), channels)?;
            upsample.push(UpsampleStage { conv, prelu });
        }

        let reconstruction =
            reader.conv("reconstruction", channels, IMAGE_CHANNELS, OUTER_KERNEL)?;

        let report = reader.finish();
        Ok((
            Self {
                entry_conv,
                entry_prelu,
                body,
                mid_conv,
                mid_bn,
                upsample,
                reconstruction,
                scale,
                channels,
                device: device.clone(),
            },
            report,
        ))
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn num_blocks(&self) -> usize {
        self.body.len()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Where the weights live and the forward pass runs.
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn forward_tensor(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let entry = x.apply(&self.entry_conv)?.apply(&self.entry_prelu)?;

        let mut h = entry.clone();
        for block in &self.body {
            h = h.apply(block)?;
        }
        let mut h = (h.apply(&self.mid_conv)?.apply(&self.mid_bn)? + &entry)?;

        for stage in &self.upsample {
            let expanded = h.apply(&stage.conv)?;
            h = candle_nn::ops::pixel_shuffle(&expanded, 2)?.apply(&stage.prelu)?;
        }

        h.apply(&self.reconstruction)
    }
}

impl Network for SrResNet {
    fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let values: Vec<f32> = input.iter().copied().collect();
        let x = Tensor::from_vec(values, input.dim(), &self.device)
            .context("failed to upload SRResNet input")?;

        let y = self
            .forward_tensor(&x)
            .context("SRResNet forward pass failed")?;

        let dims = y.dims4()?;
        let data = y
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()
            .context("failed to download SRResNet output")?;
        Array4::from_shape_vec(dims, data).context("SRResNet output has inconsistent shape")
    }

    fn name(&self) -> &str {
        "srresnet"
    }
}

fn count_body_blocks(params: &ParamTable) -> Option<usize> {
    let indices: BTreeSet<usize> = params
        .keys()
        .filter_map(|key| key.strip_prefix("body."))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|index| index.parse().ok())
        .collect();
    indices.last().map(|max| max + 1)
}

fn same_padding(kernel: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    }
}

/// Pulls layers out of a [`VarBuilder`] while recording what was used.
struct ParamReader<'a> {
    vb: VarBuilder<'a>,
    shapes: HashMap<String, Vec<usize>>,
    used: HashSet<String>,
    missing: Vec<String>,
}

impl<'a> ParamReader<'a> {
    fn new(vb: VarBuilder<'a>, shapes: HashMap<String, Vec<usize>>) -> Self {
        Self {
            vb,
            shapes,
            used: HashSet::new(),
            missing: Vec::new(),
        }
    }

    fn take(&mut self, key: String, expected: &[usize]) -> Result<Option<Tensor>> {
        if !self.vb.contains_tensor(&key) {
            self.missing.push(key);
            return Ok(None);
        }
        if let Some(shape) = self.shapes.get(&key) {
            if shape.as_slice() != expected {
                bail!("parameter '{key}' has shape {shape:?}, expected {expected:?}");
            }
        }
        let tensor = self
            .vb
            .get(expected, &key)
            .with_context(|| format!("failed to place parameter '{key}'"))?;
        self.used.insert(key);
        Ok(Some(tensor))
    }

    fn conv(&mut self, prefix: &str, in_c: usize, out_c: usize, k: usize) -> Result<Conv2d> {
        let weight = self.take(format!("{prefix}.weight"), &[out_c, in_c, k, k])?;
        let bias = self.take(format!("{prefix}.bias"), &[out_c])?;
        let weight = match weight {
            Some(weight) => weight,
            None => Tensor::zeros((out_c, in_c, k, k), DType::F32, self.vb.device())?,
        };
        Ok(Conv2d::new(weight, bias, same_padding(k)))
    }

    fn bn(&mut self, prefix: &str, channels: usize) -> Result<EvalNorm> {
        let shape = [channels];
        let gamma = self.take(format!("{prefix}.weight"), &shape)?;
        let beta = self.take(format!("{prefix}.bias"), &shape)?;
        let mean = self.take(format!("{prefix}.running_mean"), &shape)?;
        let var = self.take(format!("{prefix}.running_var"), &shape)?;
        // Step counter carries no inference state.
        self.used.insert(format!("{prefix}.num_batches_tracked"));

        if gamma.is_none() && beta.is_none() && mean.is_none() && var.is_none() {
            return Ok(EvalNorm(None));
        }

        let device = self.vb.device().clone();
        let or = |t: Option<Tensor>, fill: f32| -> Result<Tensor> {
            match t {
                Some(t) => Ok(t),
                None => Ok(Tensor::full(fill, channels, &device)?),
            }
        };
        let bn = BatchNorm::new(
            channels,
            or(mean, 0.0)?,
            or(var, 1.0)?,
            or(gamma, 1.0)?,
            or(beta, 0.0)?,
            BATCH_NORM_EPS,
        )
        .with_context(|| format!("invalid batch norm '{prefix}'"))?;
        Ok(EvalNorm(Some(bn)))
    }

    fn prelu(&mut self, prefix: &str, channels: usize) -> Result<PReLU> {
        let key = format!("{prefix}.weight");
        let Some(shape) = self.shapes.get(&key).cloned() else {
            self.missing.push(key);
            let slope = Tensor::new(&[DEFAULT_PRELU_SLOPE], self.vb.device())?;
            return Ok(PReLU::new(slope, true));
        };

        let n: usize = shape.iter().product();
        if n != 1 && n != channels {
            bail!("PReLU '{key}' has {n} slopes, expected 1 or {channels}");
        }
        let slopes = self
            .vb
            .get(shape, &key)
            .with_context(|| format!("failed to place parameter '{key}'"))?;
        self.used.insert(key);
        if n == 1 {
            Ok(PReLU::new(slopes.reshape(1)?, true))
        } else {
            Ok(PReLU::new(slopes.reshape((1, channels, 1, 1))?, false))
        }
    }

    fn finish(self) -> LoadReport {
        let mut unexpected: Vec<String> = self
            .shapes
            .keys()
            .filter(|key| !self.used.contains(*key))
            .cloned()
            .collect();
        unexpected.sort();
        LoadReport {
            missing: self.missing,
            unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[usize], value: f32) -> Tensor {
        Tensor::full(value, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_empty_table_builds_default_architecture() {
        let (net, report) = SrResNet::from_params(ParamTable::new(), 2, &Device::Cpu).unwrap();
        assert_eq!(net.channels(), DEFAULT_CHANNELS);
        assert_eq!(net.num_blocks(), DEFAULT_BLOCKS);
        assert!(net.device().is_cpu());
        assert!(report.missing.contains(&"entry.0.weight".to_string()));
        assert!(report.missing.contains(&"reconstruction.bias".to_string()));
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_infers_channels_and_blocks_from_table() {
        let mut params = ParamTable::new();
        params.insert("entry.0.weight".into(), tensor(&[4, 3, 9, 9], 0.0));
        params.insert("body.0.conv1.weight".into(), tensor(&[4, 4, 3, 3], 0.0));
        params.insert("body.2.conv1.weight".into(), tensor(&[4, 4, 3, 3], 0.0));
        params.insert("body.0.bn1.num_batches_tracked".into(), tensor(&[], 10.0));
        params.insert("extra.head.weight".into(), tensor(&[1], 0.0));

        let (net, report) = SrResNet::from_params(params, 4, &Device::Cpu).unwrap();
        assert_eq!(net.channels(), 4);
        assert_eq!(net.num_blocks(), 3);
        assert_eq!(net.scale(), 4);
        assert_eq!(report.unexpected, vec!["extra.head.weight".to_string()]);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut params = ParamTable::new();
        params.insert("entry.0.weight".into(), tensor(&[4, 3, 9, 9], 0.0));
        params.insert("mid_conv.0.weight".into(), tensor(&[4, 4, 5, 5], 0.0));
        let err = SrResNet::from_params(params, 2, &Device::Cpu)
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("mid_conv.0.weight"));
    }

    #[test]
    fn test_rejects_unsupported_scale() {
        assert!(SrResNet::from_params(ParamTable::new(), 3, &Device::Cpu).is_err());
    }

    #[test]
    fn test_half_precision_parameters_are_widened() {
        let mut params = ParamTable::new();
        params.insert(
            "reconstruction.bias".into(),
            tensor(&[3], 0.5).to_dtype(DType::F16).unwrap(),
        );
        let (net, report) = SrResNet::from_params(params, 2, &Device::Cpu).unwrap();
        assert!(report.unexpected.is_empty());

        let output = net.forward(&Array4::<f32>::zeros((1, 3, 2, 2))).unwrap();
        assert!(output.iter().all(|v| (*v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_forward_output_shape_follows_scale() {
        let mut params = ParamTable::new();
        params.insert("entry.0.weight".into(), tensor(&[4, 3, 9, 9], 0.01));
        params.insert("body.0.conv1.weight".into(), tensor(&[4, 4, 3, 3], 0.01));
        params.insert("body.0.bn1.running_var".into(), tensor(&[4], 2.0));
        params.insert("upsample.2.weight".into(), tensor(&[4], 0.1));
        params.insert("reconstruction.bias".into(), tensor(&[3], 0.5));

        let (net, report) = SrResNet::from_params(params, 2, &Device::Cpu).unwrap();
        assert!(report.unexpected.is_empty());
        let input = Array4::<f32>::from_elem((1, 3, 5, 7), 0.5);
        let output = net.forward(&input).unwrap();
        assert_eq!(output.shape(), &[1, 3, 10, 14]);
        // Missing reconstruction weights are zero, so only the bias survives.
        assert!(output.iter().all(|v| (*v - 0.5).abs() < 1e-6));
    }
}
