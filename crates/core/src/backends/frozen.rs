//! Adapter for the OpenCV `dnn_superres` model family (EDSR, ESPCN, FSRCNN,
//! LapSRN), exported to ONNX as `{algorithm}_x{scale}.onnx`.
//!
//! The whole image goes through the network in one pass. Pre/post-processing
//! follows the vendor: EDSR works on mean-shifted BGR in 0..255, the others
//! upscale the luma channel only and take chroma from a bicubic upscale.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use ndarray::{Array3, Array4};
use tracing::{debug, info};

use super::{BackendKind, SuperResolutionBackend};
use crate::device::Device;
use crate::error::{SrError, SrResult};
use crate::loader::{self, ModelHandle};
use crate::nn::{ChannelOrder, TensorLayout, ValueRange};
use crate::resize;
use crate::types::{BgrImage, EnhancementRequest};
use crate::zoo::{BackendDescriptor, NetArch, WeightSource};

pub const DEFAULT_ALGORITHM: &str = "edsr";
pub const DEFAULT_SCALE: u32 = 2;
pub const MODELS_ENV: &str = "SR_SUPERRES_MODELS";
pub const VENDOR_MODELS_URL: &str = "https://github.com/Saafke/EDSR_Tensorflow/tree/master/models";

/// Per-channel BGR mean EDSR was trained with.
const EDSR_MEAN: [f32; 3] = [103.154_578_2, 111.561_547, 114.356_29];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorAlgorithm {
    Edsr,
    Espcn,
    Fsrcnn,
    Lapsrn,
}

impl VendorAlgorithm {
    pub fn parse(name: &str) -> SrResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "edsr" => Ok(Self::Edsr),
            "espcn" => Ok(Self::Espcn),
            "fsrcnn" => Ok(Self::Fsrcnn),
            "lapsrn" => Ok(Self::Lapsrn),
            other => Err(SrError::invalid(format!(
                "unknown super-resolution algorithm '{other}' (expected edsr, espcn, fsrcnn or lapsrn)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Edsr => "edsr",
            Self::Espcn => "espcn",
            Self::Fsrcnn => "fsrcnn",
            Self::Lapsrn => "lapsrn",
        }
    }

    pub fn supported_scales(&self) -> &'static [u32] {
        match self {
            Self::Edsr | Self::Espcn | Self::Fsrcnn => &[2, 3, 4],
            Self::Lapsrn => &[2, 4, 8],
        }
    }

    /// Whether the network sees only the Y channel of YCrCb.
    pub fn luma_only(&self) -> bool {
        !matches!(self, Self::Edsr)
    }

    pub fn file_name(&self, scale: u32) -> String {
        format!("{}_x{scale}.onnx", self.name())
    }

    fn layout(&self) -> TensorLayout {
        match self {
            Self::Edsr => TensorLayout {
                channel_order: ChannelOrder::Bgr,
                value_range: ValueRange::ByteRange,
                pad_align: 1,
            },
            _ => TensorLayout {
                channel_order: ChannelOrder::Bgr,
                value_range: ValueRange::UnitInterval,
                pad_align: 1,
            },
        }
    }

    pub fn descriptor(&self, scale: u32) -> BackendDescriptor {
        BackendDescriptor {
            name: format!("{}_x{scale}", self.name()),
            native_scale: scale,
            arch: NetArch::VendorFrozen,
            weights: WeightSource::Local {
                file_name: self.file_name(scale),
            },
            layout: self.layout(),
            upstream_url: Some(VENDOR_MODELS_URL.to_string()),
            description: format!("OpenCV dnn_superres {} x{scale}", self.name()),
        }
    }
}

pub struct FrozenModelBackend {
    algorithm: VendorAlgorithm,
    native_scale: u32,
    handle: ModelHandle,
}

impl FrozenModelBackend {
    pub fn new(
        model_name: &str,
        native_scale: u32,
        explicit_path: Option<&Path>,
        models_dir: &Path,
        device: Device,
    ) -> SrResult<Self> {
        let algorithm = VendorAlgorithm::parse(model_name)?;
        if !algorithm.supported_scales().contains(&native_scale) {
            return Err(SrError::invalid(format!(
                "{} does not ship an x{native_scale} model (available: {:?})",
                algorithm.name(),
                algorithm.supported_scales()
            )));
        }

        let descriptor = algorithm.descriptor(native_scale);
        let path = resolve_model_path(
            descriptor.weights.file_name(),
            explicit_path,
            env::var_os(MODELS_ENV).as_deref(),
            models_dir,
            env::current_dir().ok().as_deref(),
        )?;

        let handle = loader::load_graph(
            &path,
            device,
            native_scale,
            descriptor.layout,
            &BackendKind::Frozen.to_string(),
        )?;

        info!(
            algorithm = algorithm.name(),
            scale = native_scale,
            model = %path.display(),
            "Vendor super-resolution model ready"
        );
        Ok(Self {
            algorithm,
            native_scale,
            handle,
        })
    }

    pub fn from_handle(algorithm: VendorAlgorithm, handle: ModelHandle) -> Self {
        Self {
            algorithm,
            native_scale: handle.native_scale(),
            handle,
        }
    }

    pub fn algorithm(&self) -> VendorAlgorithm {
        self.algorithm
    }

    /// One forward pass at the model's native scale.
    pub fn upsample(&self, image: &BgrImage) -> SrResult<BgrImage> {
        debug!(
            algorithm = self.algorithm.name(),
            width = image.width(),
            height = image.height(),
            "Running vendor model"
        );
        if self.algorithm.luma_only() {
            self.upsample_luma(image)
        } else {
            self.upsample_mean_shifted(image)
        }
    }

    fn forward(&self, input: &Array4<f32>, channels: usize, h: usize, w: usize) -> SrResult<Array4<f32>> {
        let output = self
            .handle
            .network()
            .forward(input)
            .map_err(|e| SrError::inference(e.context("vendor model forward pass failed")))?;

        let s = self.native_scale as usize;
        let expected = [1, channels, h * s, w * s];
        if output.shape() != expected {
            return Err(SrError::inference(anyhow::anyhow!(
                "vendor model returned {:?}, expected {:?}",
                output.shape(),
                expected
            )));
        }
        Ok(output)
    }

    fn upsample_mean_shifted(&self, image: &BgrImage) -> SrResult<BgrImage> {
        let (h, w) = (image.height(), image.width());
        let pixels = image.pixels();
        let input = Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            pixels[[y, x, c]] as f32 - EDSR_MEAN[c]
        });

        let output = self.forward(&input, 3, h, w)?;
        let (_, _, out_h, out_w) = output.dim();
        let out = Array3::from_shape_fn((out_h, out_w, 3), |(y, x, c)| {
            to_u8(output[[0, c, y, x]] + EDSR_MEAN[c])
        });
        Ok(BgrImage::from_array_unchecked(out))
    }

    fn upsample_luma(&self, image: &BgrImage) -> SrResult<BgrImage> {
        let (h, w) = (image.height(), image.width());
        let pixels = image.pixels();
        let input = Array4::from_shape_fn((1, 1, h, w), |(_, _, y, x)| {
            let [b, g, r] = bgr_f32(pixels[[y, x, 0]], pixels[[y, x, 1]], pixels[[y, x, 2]]);
            luma(b, g, r) / 255.0
        });

        let output = self.forward(&input, 1, h, w)?;
        let (_, _, out_h, out_w) = output.dim();

        // Chroma comes from a bicubic upscale of the input.
        let chroma_src = resize::resize_to(image, out_h, out_w, resize::Filter::Cubic);
        let chroma = chroma_src.pixels();
        let out = Array3::from_shape_fn((out_h, out_w, 3), |(y, x, c)| {
            let [b, g, r] = bgr_f32(chroma[[y, x, 0]], chroma[[y, x, 1]], chroma[[y, x, 2]]);
            let y_old = luma(b, g, r);
            let cr = (r - y_old) * 0.713 + 128.0;
            let cb = (b - y_old) * 0.564 + 128.0;
            let y_new = output[[0, 0, y, x]].clamp(0.0, 1.0) * 255.0;
            let v = match c {
                0 => y_new + 1.773 * (cb - 128.0),
                1 => y_new - 0.714 * (cr - 128.0) - 0.344 * (cb - 128.0),
                _ => y_new + 1.403 * (cr - 128.0),
            };
            to_u8(v)
        });
        Ok(BgrImage::from_array_unchecked(out))
    }
}

impl SuperResolutionBackend for FrozenModelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Frozen
    }

    fn enhance(&self, image: &BgrImage, request: &EnhancementRequest) -> SrResult<BgrImage> {
        request.validate()?;
        let upscaled = self.upsample(image)?;
        resize::correct(&upscaled, request.scale, self.native_scale as f64)
    }
}

/// Upscale `image` with the vendor model `model_name` at `native_scale`,
/// looking the graph up in `models/` unless `artifact_path` is given.
pub fn enhance(
    image: &BgrImage,
    model_name: &str,
    native_scale: u32,
    artifact_path: Option<&Path>,
) -> SrResult<BgrImage> {
    let backend = FrozenModelBackend::new(
        model_name,
        native_scale,
        artifact_path,
        Path::new("models"),
        Device::resolve(None),
    )?;
    backend.upsample(image)
}

/// Locate `file_name`: the explicit path if given (and then nothing else),
/// otherwise each directory of `env_dirs`, then `models_dir`, then `cwd`.
pub fn resolve_model_path(
    file_name: &str,
    explicit: Option<&Path>,
    env_dirs: Option<&OsStr>,
    models_dir: &Path,
    cwd: Option<&Path>,
) -> SrResult<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(SrError::ArtifactNotFound {
            path: path.to_path_buf(),
            hint: Some(format!(
                "download pre-trained weights (e.g. EDSR) from {VENDOR_MODELS_URL}, export them \
                 to ONNX, or place your model in a directory listed in {MODELS_ENV}"
            )),
        });
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dirs) = env_dirs {
        candidates.extend(
            env::split_paths(dirs)
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.join(file_name)),
        );
    }
    candidates.push(models_dir.join(file_name));
    if let Some(cwd) = cwd {
        candidates.push(cwd.join(file_name));
    }

    for candidate in &candidates {
        if candidate.exists() {
            debug!(model = %candidate.display(), "Resolved vendor model");
            return Ok(candidate.clone());
        }
    }

    Err(SrError::ArtifactNotFound {
        path: PathBuf::from(file_name),
        hint: Some(format!(
            "download the OpenCV DNN models (EDSR/FSRCNN/etc.) from {VENDOR_MODELS_URL}, export \
             them to ONNX and place them under {} or set {MODELS_ENV} to their directory",
            models_dir.display()
        )),
    })
}

fn bgr_f32(b: u8, g: u8, r: u8) -> [f32; 3] {
    [b as f32, g as f32, r as f32]
}

fn luma(b: f32, g: f32, r: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Checkpoint;
    use crate::nn::Network;

    /// Nearest-neighbour upscaler over any channel count.
    struct Replicate(usize);

    impl Network for Replicate {
        fn forward(&self, input: &Array4<f32>) -> anyhow::Result<Array4<f32>> {
            let (n, c, h, w) = input.dim();
            let s = self.0;
            Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(b, c, y, x)| {
                input[[b, c, y / s, x / s]]
            }))
        }

        fn name(&self) -> &str {
            "replicate"
        }
    }

    fn backend(algorithm: VendorAlgorithm, scale: u32) -> FrozenModelBackend {
        let handle = ModelHandle::new(
            Box::new(Replicate(scale as usize)),
            scale,
            algorithm.file_name(scale),
            Checkpoint::DirectModel,
            algorithm.layout(),
        );
        FrozenModelBackend::from_handle(algorithm, handle)
    }

    #[test]
    fn test_algorithm_parse_and_scales() {
        assert_eq!(VendorAlgorithm::parse("EDSR").unwrap(), VendorAlgorithm::Edsr);
        assert_eq!(VendorAlgorithm::parse("lapsrn").unwrap(), VendorAlgorithm::Lapsrn);
        assert!(matches!(
            VendorAlgorithm::parse("srgan"),
            Err(SrError::InvalidRequest(_))
        ));
        assert_eq!(VendorAlgorithm::Lapsrn.supported_scales(), &[2, 4, 8]);
        assert_eq!(VendorAlgorithm::Edsr.file_name(3), "edsr_x3.onnx");
    }

    #[test]
    fn test_unsupported_native_scale_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrozenModelBackend::new("espcn", 8, None, dir.path(), Device::Cpu)
            .err()
            .expect("x8 espcn does not exist");
        assert!(matches!(err, SrError::InvalidRequest(_)));
    }

    #[test]
    fn test_explicit_missing_path_has_hint() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.onnx");
        let err = resolve_model_path("edsr_x2.onnx", Some(&explicit), None, dir.path(), None)
            .unwrap_err();
        match err {
            SrError::ArtifactNotFound { path, hint } => {
                assert_eq!(path, explicit);
                assert!(hint.unwrap().contains(VENDOR_MODELS_URL));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_search_order_env_then_models_then_cwd() {
        let root = tempfile::tempdir().unwrap();
        let env_a = root.path().join("env_a");
        let env_b = root.path().join("env_b");
        let models = root.path().join("models");
        let cwd = root.path().join("cwd");
        for dir in [&env_a, &env_b, &models, &cwd] {
            std::fs::create_dir_all(dir).unwrap();
        }
        let joined = env::join_paths([&env_a, &env_b]).unwrap();
        let file = "fsrcnn_x3.onnx";

        std::fs::write(cwd.join(file), b"cwd").unwrap();
        let found =
            resolve_model_path(file, None, Some(&joined), &models, Some(&cwd)).unwrap();
        assert_eq!(found, cwd.join(file));

        std::fs::write(models.join(file), b"models").unwrap();
        let found =
            resolve_model_path(file, None, Some(&joined), &models, Some(&cwd)).unwrap();
        assert_eq!(found, models.join(file));

        std::fs::write(env_b.join(file), b"env").unwrap();
        let found =
            resolve_model_path(file, None, Some(&joined), &models, Some(&cwd)).unwrap();
        assert_eq!(found, env_b.join(file));
    }

    #[test]
    fn test_not_found_names_env_variable() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_model_path("edsr_x4.onnx", None, None, dir.path(), None).unwrap_err();
        match err {
            SrError::ArtifactNotFound { hint: Some(hint), .. } => {
                assert!(hint.contains(MODELS_ENV));
                assert!(hint.contains(VENDOR_MODELS_URL));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_edsr_mean_shift_round_trips() {
        let image = BgrImage::solid(2, 3, [10, 128, 250]);
        let out = backend(VendorAlgorithm::Edsr, 2).upsample(&image).unwrap();
        assert_eq!((out.height(), out.width()), (4, 6));
        assert_eq!(out.pixel(3, 5), [10, 128, 250]);
    }

    #[test]
    fn test_luma_path_preserves_grey() {
        let image = BgrImage::solid(3, 3, [90, 90, 90]);
        let out = backend(VendorAlgorithm::Fsrcnn, 3).upsample(&image).unwrap();
        assert_eq!((out.height(), out.width()), (9, 9));
        for y in 0..9 {
            for x in 0..9 {
                assert_eq!(out.pixel(y, x), [90, 90, 90]);
            }
        }
    }

    #[test]
    fn test_enhance_applies_scale_correction() {
        let image = BgrImage::solid(4, 4, [1, 2, 3]);
        let out = backend(VendorAlgorithm::Edsr, 2)
            .enhance(&image, &EnhancementRequest::with_scale(3.0))
            .unwrap();
        assert_eq!((out.height(), out.width()), (12, 12));
    }
}
