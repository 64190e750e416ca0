//! Interchangeable upscaling backends behind one contract.
//!
//! [`BackendRegistry::probe`] decides once, at startup, which backends can
//! run in this process. The native backend needs nothing beyond this crate;
//! the frozen-graph and GAN backends need the ONNX Runtime library.

pub mod frozen;
pub mod gan;
pub mod native;

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::device::Device;
use crate::error::{SrError, SrResult};
use crate::runtime::{self, RuntimeLoadError};
use crate::types::{BgrImage, EnhancementRequest};
use crate::zoo::ModelZoo;

pub use crate::progress::{TileObserver, TiledRun, TracingTileObserver};
pub use frozen::FrozenModelBackend;
pub use gan::GanBackend;
pub use native::NativeBackend;

pub trait SuperResolutionBackend {
    fn kind(&self) -> BackendKind;

    fn enhance(&self, image: &BgrImage, request: &EnhancementRequest) -> SrResult<BgrImage>;

    /// Same as [`enhance`](Self::enhance); backends that tile report each
    /// tile to `observer`.
    fn enhance_with_progress(
        &self,
        image: &BgrImage,
        request: &EnhancementRequest,
        _observer: &dyn TileObserver,
    ) -> SrResult<BgrImage> {
        self.enhance(image, request)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[default]
    Native,
    Frozen,
    Gan,
}

impl BackendKind {
    pub fn needs_onnx_runtime(&self) -> bool {
        !matches!(self, Self::Native)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Frozen => write!(f, "frozen"),
            Self::Gan => write!(f, "gan"),
        }
    }
}

/// Everything a caller may pin when constructing a backend. Unset fields
/// fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub device: Option<Device>,
    /// Checkpoint for the native backend, explicit graph for the frozen one.
    pub model_path: Option<PathBuf>,
    /// Algorithm (frozen) or zoo entry (GAN).
    pub model_name: Option<String>,
    /// Native scale of a frozen model.
    pub native_scale: Option<u32>,
    /// Requested overall scale; picks the fallback GAN architecture.
    pub scale: Option<f64>,
}

pub struct BackendRegistry {
    config: AppConfig,
    models_dir: PathBuf,
    registered: Vec<BackendKind>,
    onnx_error: Option<RuntimeLoadError>,
}

impl BackendRegistry {
    /// Register the native backend plus every backend whose runtime library
    /// loads in this process.
    pub fn probe(config: &AppConfig, models_dir: PathBuf) -> Self {
        Self::from_runtime_probe(config, models_dir, runtime::onnx_runtime())
    }

    pub fn from_runtime_probe(
        config: &AppConfig,
        models_dir: PathBuf,
        onnx: Result<PathBuf, RuntimeLoadError>,
    ) -> Self {
        let mut registered = vec![BackendKind::Native];
        let onnx_error = match onnx {
            Ok(library) => {
                debug!(library = %library.display(), "ONNX Runtime found");
                registered.extend([BackendKind::Frozen, BackendKind::Gan]);
                None
            }
            Err(error) => {
                warn!(
                    error = %error,
                    "ONNX Runtime not loadable; frozen and gan backends disabled"
                );
                Some(error)
            }
        };

        info!(
            backends = ?registered.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Registered backends"
        );

        Self {
            config: config.clone(),
            models_dir,
            registered,
            onnx_error,
        }
    }

    pub fn available(&self) -> &[BackendKind] {
        &self.registered
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.registered.contains(&kind)
    }

    pub fn require(&self, kind: BackendKind) -> SrResult<()> {
        if self.is_available(kind) {
            return Ok(());
        }
        let source: crate::error::BoxError = match &self.onnx_error {
            Some(error) if kind.needs_onnx_runtime() => Box::new(error.clone()),
            _ => format!("backend '{kind}' was not registered").into(),
        };
        Err(SrError::OptionalBackendUnavailable {
            backend: kind.to_string(),
            source,
        })
    }

    pub fn create(
        &self,
        kind: BackendKind,
        options: &BackendOptions,
    ) -> SrResult<Box<dyn SuperResolutionBackend>> {
        self.require(kind)?;
        let device = Device::resolve(options.device);

        let backend: Box<dyn SuperResolutionBackend> = match kind {
            BackendKind::Native => Box::new(NativeBackend::new(
                device,
                options.model_path.as_deref(),
            )?),
            BackendKind::Frozen => {
                let name = options
                    .model_name
                    .as_deref()
                    .unwrap_or(frozen::DEFAULT_ALGORITHM);
                let scale = options.native_scale.unwrap_or(frozen::DEFAULT_SCALE);
                Box::new(FrozenModelBackend::new(
                    name,
                    scale,
                    options.model_path.as_deref(),
                    &self.models_dir,
                    device,
                )?)
            }
            BackendKind::Gan => {
                let name = options
                    .model_name
                    .as_deref()
                    .unwrap_or(&self.config.gan.default_model);
                let scale = options.scale.unwrap_or(self.config.enhance.scale);
                let mut zoo = ModelZoo::with_builtin_models(self.models_dir.clone());
                if let Err(error) = zoo.discover() {
                    warn!(error = %format!("{error:#}"), "Model discovery failed");
                }
                Box::new(GanBackend::new(&zoo, name, scale, device, &self.config.gan)?)
            }
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_runtime() -> RuntimeLoadError {
        RuntimeLoadError {
            library: PathBuf::from("libonnxruntime.so"),
            detail: "cannot open shared object file".to_string(),
        }
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Native.to_string(), "native");
        assert_eq!(BackendKind::Frozen.to_string(), "frozen");
        assert_eq!(BackendKind::Gan.to_string(), "gan");
    }

    #[test]
    fn test_registry_without_runtime_keeps_native() {
        let registry = BackendRegistry::from_runtime_probe(
            &AppConfig::default(),
            PathBuf::from("models"),
            Err(missing_runtime()),
        );
        assert_eq!(registry.available(), &[BackendKind::Native]);
        assert!(registry.require(BackendKind::Native).is_ok());
    }

    #[test]
    fn test_registry_chains_runtime_error() {
        let registry = BackendRegistry::from_runtime_probe(
            &AppConfig::default(),
            PathBuf::from("models"),
            Err(missing_runtime()),
        );

        let err = registry.require(BackendKind::Gan).unwrap_err();
        match &err {
            SrError::OptionalBackendUnavailable { backend, .. } => assert_eq!(backend, "gan"),
            other => panic!("unexpected error: {other:?}"),
        }
        let source = std::error::Error::source(&err).expect("source should be chained");
        assert!(source.to_string().contains("libonnxruntime.so"));

        let err = registry
            .create(BackendKind::Frozen, &BackendOptions::default())
            .err()
            .expect("frozen backend must be unavailable");
        assert!(matches!(err, SrError::OptionalBackendUnavailable { .. }));
    }

    #[test]
    fn test_registry_with_runtime_registers_all() {
        let registry = BackendRegistry::from_runtime_probe(
            &AppConfig::default(),
            PathBuf::from("models"),
            Ok(PathBuf::from("/usr/lib/libonnxruntime.so")),
        );
        assert_eq!(
            registry.available(),
            &[BackendKind::Native, BackendKind::Frozen, BackendKind::Gan]
        );
    }

    #[test]
    fn test_registry_creates_native_without_model() {
        let registry = BackendRegistry::from_runtime_probe(
            &AppConfig::default(),
            PathBuf::from("models"),
            Err(missing_runtime()),
        );
        let options = BackendOptions {
            device: Some(Device::Cpu),
            ..Default::default()
        };
        let backend = registry.create(BackendKind::Native, &options).unwrap();
        assert_eq!(backend.kind(), BackendKind::Native);

        let image = BgrImage::solid(2, 3, [7, 8, 9]);
        let out = backend
            .enhance(&image, &EnhancementRequest::with_scale(2.0))
            .unwrap();
        assert_eq!((out.height(), out.width()), (4, 6));
    }
}
