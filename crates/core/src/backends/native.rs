use std::path::Path;

use tracing::warn;

use super::{BackendKind, SuperResolutionBackend, TileObserver};
use crate::device::Device;
use crate::error::SrResult;
use crate::facade::SuperResolution;
use crate::types::{BgrImage, EnhancementRequest};

/// The facade exposed as a backend. Without a checkpoint it only resamples.
pub struct NativeBackend {
    inner: SuperResolution,
}

impl NativeBackend {
    pub fn new(device: Device, checkpoint: Option<&Path>) -> SrResult<Self> {
        let mut inner = SuperResolution::new(Some(device));
        match checkpoint {
            Some(path) => inner.load_model(path)?,
            None => warn!("No model given; native backend falls back to bicubic resampling"),
        }
        Ok(Self { inner })
    }

    pub fn facade(&self) -> &SuperResolution {
        &self.inner
    }
}

impl SuperResolutionBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn enhance(&self, image: &BgrImage, request: &EnhancementRequest) -> SrResult<BgrImage> {
        self.inner.enhance_image(image, request)
    }

    fn enhance_with_progress(
        &self,
        image: &BgrImage,
        request: &EnhancementRequest,
        observer: &dyn TileObserver,
    ) -> SrResult<BgrImage> {
        self.inner.enhance_image_with_observer(image, request, observer)
    }
}
