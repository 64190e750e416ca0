//! Turns a model artifact on disk into an executable [`ModelHandle`].
//!
//! Two artifact families are understood:
//! - `.onnx` graphs, executed through ONNX Runtime ([`Checkpoint::DirectModel`]);
//! - safetensors parameter tables, materialised as the native SRResNet, either
//!   nested under a conventional key prefix or flat.
//!
//! Pickled PyTorch checkpoints are rejected with a conversion hint.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{SrError, SrResult};
use crate::nn::onnx::OnnxNetwork;
use crate::nn::srresnet::{ParamTable, SrResNet};
use crate::nn::{Network, TensorLayout};
use crate::runtime;

/// Scales a native SRResNet can be built for.
pub const SUPPORTED_SCALES: [u32; 3] = [2, 4, 8];
pub const DEFAULT_NATIVE_SCALE: u32 = 2;

/// Key prefixes that wrap a parameter table, in lookup order.
pub const NESTED_KEYS: [&str; 4] = ["state_dict", "params_ema", "params", "model"];

const DATA_PARALLEL_PREFIX: &str = "module.";
const STEP_COUNTER_SUFFIX: &str = ".num_batches_tracked";
const PICKLE_EXTENSIONS: [&str; 4] = ["pth", "pt", "ckpt", "pkl"];

/// Which shape of artifact a handle was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    /// A self-contained executable graph.
    DirectModel,
    /// A parameter table whose entries live under `{key}.`.
    NestedStateDict { key: String },
    /// A flat parameter table.
    BareStateDict,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectModel => write!(f, "direct"),
            Self::NestedStateDict { key } => write!(f, "nested({key})"),
            Self::BareStateDict => write!(f, "bare"),
        }
    }
}

/// A loaded, ready-to-run model.
pub struct ModelHandle {
    network: Box<dyn Network>,
    native_scale: u32,
    path: PathBuf,
    checkpoint: Checkpoint,
    layout: TensorLayout,
}

impl ModelHandle {
    pub fn new(
        network: Box<dyn Network>,
        native_scale: u32,
        path: impl Into<PathBuf>,
        checkpoint: Checkpoint,
        layout: TensorLayout,
    ) -> Self {
        Self {
            network,
            native_scale,
            path: path.into(),
            checkpoint,
            layout,
        }
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn native_scale(&self) -> u32 {
        self.native_scale
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("network", &self.network.name())
            .field("native_scale", &self.native_scale)
            .field("path", &self.path)
            .field("checkpoint", &self.checkpoint)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Native scale encoded in a file name as `_x<digits>`.
///
/// The first `_x` followed by digits decides; values outside
/// [`SUPPORTED_SCALES`] and names without a hint give
/// [`DEFAULT_NATIVE_SCALE`].
pub fn scale_hint_from_file_name(path: &Path) -> u32 {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    for (index, _) in name.match_indices("_x") {
        let digits: String = name[index + 2..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            continue;
        }
        let candidate = digits.parse::<u32>().unwrap_or(0).max(1);
        return if SUPPORTED_SCALES.contains(&candidate) {
            candidate
        } else {
            DEFAULT_NATIVE_SCALE
        };
    }
    DEFAULT_NATIVE_SCALE
}

/// Load the artifact at `path` for execution on `device`.
pub fn load(path: &Path, device: Device) -> SrResult<ModelHandle> {
    if !path.exists() {
        return Err(SrError::ArtifactNotFound {
            path: path.to_path_buf(),
            hint: None,
        });
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if extension == "onnx" {
        let scale = scale_hint_from_file_name(path);
        return load_graph(path, device, scale, TensorLayout::default(), "onnx");
    }

    if PICKLE_EXTENSIONS.contains(&extension.as_str()) {
        return Err(SrError::unsupported(
            path,
            "pickled PyTorch checkpoints cannot be read; export the state dict to \
             safetensors or the model to ONNX",
        ));
    }

    load_parameter_table(path, device)
}

/// Build an ONNX-backed handle, checking the runtime library first.
///
/// `backend` names the caller in the error when ONNX Runtime is missing.
pub fn load_graph(
    path: &Path,
    device: Device,
    native_scale: u32,
    layout: TensorLayout,
    backend: &str,
) -> SrResult<ModelHandle> {
    if let Err(error) = runtime::onnx_runtime() {
        return Err(SrError::OptionalBackendUnavailable {
            backend: backend.to_string(),
            source: Box::new(error),
        });
    }

    debug!(
        model = %path.display(),
        device = %device,
        native_scale,
        "Loading ONNX graph"
    );
    let network = OnnxNetwork::load(path, device)
        .map_err(|e| SrError::unsupported(path, format!("{e:#}")))?;

    info!(
        model = %path.display(),
        native_scale,
        fp16 = network.is_fp16(),
        "Model loaded"
    );
    Ok(ModelHandle::new(
        Box::new(network),
        native_scale,
        path,
        Checkpoint::DirectModel,
        layout,
    ))
}

fn load_parameter_table(path: &Path, device: Device) -> SrResult<ModelHandle> {
    let bytes = std::fs::read(path)
        .map_err(|e| SrError::unsupported(path, format!("failed to read file: {e}")))?;
    let parsed =
        parse_safetensors(&bytes).map_err(|e| SrError::unsupported(path, format!("{e:#}")))?;

    let native_scale = scale_hint_from_file_name(path);
    if let Some(declared) = parsed.metadata.get("scale") {
        if declared.trim().parse::<u32>().ok() != Some(native_scale) {
            warn!(
                model = %path.display(),
                declared = %declared,
                native_scale,
                "Checkpoint metadata scale disagrees with file name; using file name"
            );
        }
    }

    let (checkpoint, params) = unwrap_nested(parsed.params);
    if params.is_empty() {
        return Err(SrError::unsupported(path, "parameter table is empty"));
    }

    let placement = device.candle_device();
    let (network, report) = SrResNet::from_params(params, native_scale, &placement)
        .map_err(|e| SrError::unsupported(path, format!("{e:#}")))?;

    if !report.missing.is_empty() {
        warn!(
            model = %path.display(),
            count = report.missing.len(),
            "Checkpoint is missing parameters; defaults kept"
        );
        debug!(missing = ?report.missing, "Missing parameters");
    }
    if !report.unexpected.is_empty() {
        debug!(
            count = report.unexpected.len(),
            unexpected = ?report.unexpected,
            "Ignoring unexpected parameters"
        );
    }

    info!(
        model = %path.display(),
        checkpoint = %checkpoint,
        native_scale,
        channels = network.channels(),
        blocks = network.num_blocks(),
        device = ?network.device(),
        "Model loaded"
    );

    Ok(ModelHandle::new(
        Box::new(network),
        native_scale,
        path,
        checkpoint,
        TensorLayout::default(),
    ))
}

struct ParsedTable {
    params: ParamTable,
    metadata: HashMap<String, String>,
}

fn parse_safetensors(bytes: &[u8]) -> Result<ParsedTable> {
    let (_, header) =
        SafeTensors::read_metadata(bytes).context("not a safetensors parameter table")?;
    let metadata = header.metadata().clone().unwrap_or_default();
    // Staged on the CPU; the builder moves each weight to its device.
    let tensors = candle_core::safetensors::load_buffer(bytes, &candle_core::Device::Cpu)
        .context("not a safetensors parameter table")?;

    let mut params = ParamTable::new();
    for (name, tensor) in tensors {
        let name = strip_data_parallel_prefix(&name);
        if !tensor.dtype().is_float() {
            if name.ends_with(STEP_COUNTER_SUFFIX) {
                continue;
            }
            bail!("tensor '{name}' has non-float dtype {:?}", tensor.dtype());
        }
        params.insert(name, tensor);
    }

    Ok(ParsedTable { params, metadata })
}

fn strip_data_parallel_prefix(name: &str) -> String {
    let mut name = name;
    while let Some(rest) = name.strip_prefix(DATA_PARALLEL_PREFIX) {
        name = rest;
    }
    name.to_string()
}

/// Pick the first conventional wrapper key present and keep only its entries.
fn unwrap_nested(params: ParamTable) -> (Checkpoint, ParamTable) {
    for key in NESTED_KEYS {
        let prefix = format!("{key}.");
        if !params.keys().any(|name| name.starts_with(&prefix)) {
            continue;
        }
        let inner: ParamTable = params
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(&prefix)
                    .map(|rest| (strip_data_parallel_prefix(rest), value))
            })
            .collect();
        return (
            Checkpoint::NestedStateDict {
                key: key.to_string(),
            },
            inner,
        );
    }
    (Checkpoint::BareStateDict, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use safetensors::tensor::TensorView;
    use safetensors::Dtype;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn write_typed_table(
        path: &Path,
        entries: &[(&str, Dtype, Vec<usize>, Vec<u8>)],
        metadata: Option<HashMap<String, String>>,
    ) {
        let views: Vec<(String, TensorView<'_>)> = entries
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                (
                    name.to_string(),
                    TensorView::new(*dtype, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        let serialized = safetensors::serialize(views, &metadata).unwrap();
        std::fs::write(path, serialized).unwrap();
    }

    fn write_table(
        path: &Path,
        entries: &[(&str, Vec<usize>, Vec<f32>)],
        metadata: Option<HashMap<String, String>>,
    ) {
        let typed: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = entries
            .iter()
            .map(|(name, shape, values)| (*name, Dtype::F32, shape.clone(), f32_bytes(values)))
            .collect();
        write_typed_table(path, &typed, metadata);
    }

    #[test]
    fn test_scale_hint_from_file_name() {
        assert_eq!(scale_hint_from_file_name(Path::new("srresnet_x4.safetensors")), 4);
        assert_eq!(scale_hint_from_file_name(Path::new("/m/SRRESNET_X8.safetensors")), 8);
        assert_eq!(scale_hint_from_file_name(Path::new("model_x3.safetensors")), 2);
        assert_eq!(scale_hint_from_file_name(Path::new("model.safetensors")), 2);
        assert_eq!(scale_hint_from_file_name(Path::new("a_xy_x4.onnx")), 4);
        assert_eq!(scale_hint_from_file_name(Path::new("model_x4_final.pth")), 4);
        assert_eq!(scale_hint_from_file_name(Path::new("model_xl.safetensors")), 2);
        // Only the file name counts, not parent directories.
        assert_eq!(scale_hint_from_file_name(Path::new("/runs_x4/model.onnx")), 2);
    }

    #[test]
    fn test_missing_artifact() {
        let err = load(Path::new("/nonexistent/srresnet_x2.safetensors"), Device::Cpu).unwrap_err();
        assert!(matches!(err, SrError::ArtifactNotFound { hint: None, .. }));
    }

    #[test]
    fn test_pickle_checkpoint_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srresnet_x2.pth");
        std::fs::write(&path, b"\x80\x02}q\x00.").unwrap();
        let err = load(&path, Device::Cpu).unwrap_err();
        match err {
            SrError::UnsupportedArtifactFormat { detail, .. } => {
                assert!(detail.contains("safetensors"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights_x2.safetensors");
        std::fs::write(&path, b"definitely not a tensor file").unwrap();
        let err = load(&path, Device::Cpu).unwrap_err();
        assert!(matches!(err, SrError::UnsupportedArtifactFormat { .. }));
    }

    #[test]
    fn test_bare_table_loads_with_file_name_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny_x4.safetensors");
        write_table(
            &path,
            &[("module.entry.0.weight", vec![4, 3, 9, 9], vec![0.0; 4 * 3 * 81])],
            None,
        );

        let handle = load(&path, Device::Cpu).unwrap();
        assert_eq!(handle.native_scale(), 4);
        assert_eq!(handle.checkpoint(), &Checkpoint::BareStateDict);
        assert_eq!(handle.network().name(), "srresnet");
        assert_eq!(handle.path(), path.as_path());
    }

    #[test]
    fn test_nested_table_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny_x2.safetensors");
        write_table(
            &path,
            &[
                ("params_ema.entry.0.weight", vec![4, 3, 9, 9], vec![0.0; 4 * 3 * 81]),
                ("params_ema.entry.0.bias", vec![4], vec![0.0; 4]),
            ],
            None,
        );

        let handle = load(&path, Device::Cpu).unwrap();
        assert_eq!(
            handle.checkpoint(),
            &Checkpoint::NestedStateDict {
                key: "params_ema".to_string()
            }
        );
    }

    #[test]
    fn test_metadata_scale_does_not_override_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny_x2.safetensors");
        let metadata = HashMap::from([("scale".to_string(), "4".to_string())]);
        write_table(
            &path,
            &[("entry.0.weight", vec![4, 3, 9, 9], vec![0.0; 4 * 3 * 81])],
            Some(metadata),
        );

        let handle = load(&path, Device::Cpu).unwrap();
        assert_eq!(handle.native_scale(), 2);
    }

    #[test]
    fn test_shape_mismatch_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken_x2.safetensors");
        write_table(
            &path,
            &[
                ("entry.0.weight", vec![4, 3, 9, 9], vec![0.0; 4 * 3 * 81]),
                ("reconstruction.weight", vec![3, 4, 3, 3], vec![0.0; 3 * 4 * 9]),
            ],
            None,
        );
        let err = load(&path, Device::Cpu).unwrap_err();
        match err {
            SrError::UnsupportedArtifactFormat { detail, .. } => {
                assert!(detail.contains("reconstruction.weight"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_strip_data_parallel_prefix() {
        assert_eq!(strip_data_parallel_prefix("module.module.body.0"), "body.0");
        assert_eq!(strip_data_parallel_prefix("body.module.x"), "body.module.x");
    }

    #[test]
    fn test_half_precision_table_and_step_counters_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half_x2.safetensors");
        let entry: Vec<u8> = vec![0u8; 4 * 3 * 81 * 2];
        let bias: Vec<u8> = [0.5f32, -1.0, 2.0, 0.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        let counter: Vec<u8> = 7i64.to_le_bytes().to_vec();
        write_typed_table(
            &path,
            &[
                ("entry.0.weight", Dtype::F16, vec![4, 3, 9, 9], entry),
                ("entry.0.bias", Dtype::F16, vec![4], bias),
                ("body.0.bn1.num_batches_tracked", Dtype::I64, vec![], counter),
            ],
            None,
        );

        let handle = load(&path, Device::Cpu).unwrap();
        assert_eq!(handle.native_scale(), 2);
    }

    #[test]
    fn test_integer_weights_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantised_x2.safetensors");
        write_typed_table(
            &path,
            &[("entry.0.weight", Dtype::I64, vec![1], 3i64.to_le_bytes().to_vec())],
            None,
        );
        match load(&path, Device::Cpu).unwrap_err() {
            SrError::UnsupportedArtifactFormat { detail, .. } => {
                assert!(detail.contains("entry.0.weight"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
