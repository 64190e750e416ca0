//! The `SuperResolution` facade: one device, at most one loaded model.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{SrError, SrResult};
use crate::inference;
use crate::loader::{self, ModelHandle};
use crate::progress::{TileObserver, TiledRun, TracingTileObserver};
use crate::resize;
use crate::stitch::{Canvas, Placement};
use crate::tiling;
use crate::types::{BgrImage, EnhancementRequest};

pub struct SuperResolution {
    device: Device,
    model: Option<ModelHandle>,
}

impl SuperResolution {
    /// Resolve the device; no model is loaded yet.
    pub fn new(device: Option<Device>) -> Self {
        Self {
            device: Device::resolve(device),
            model: None,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    /// Load `path` and make it the active model. On failure the previously
    /// loaded model, if any, stays active.
    pub fn load_model(&mut self, path: &Path) -> SrResult<()> {
        let handle = loader::load(path, self.device)?;
        if let Some(previous) = &self.model {
            debug!(
                previous = %previous.path().display(),
                next = %handle.path().display(),
                "Replacing loaded model"
            );
        }
        self.model = Some(handle);
        Ok(())
    }

    /// Install an already-built handle.
    pub fn set_model(&mut self, handle: ModelHandle) {
        self.model = Some(handle);
    }

    /// Upscale `image` to `request.scale`.
    ///
    /// Without a model this is plain bicubic resampling. With one, the image
    /// runs through the network (tiled when `use_patches` is set and the
    /// longer side exceeds `patch_size`), is stitched at the native scale and
    /// finally resampled if the requested scale differs.
    pub fn enhance_image(
        &self,
        image: &BgrImage,
        request: &EnhancementRequest,
    ) -> SrResult<BgrImage> {
        self.enhance_image_with_observer(image, request, &TracingTileObserver)
    }

    /// [`enhance_image`](Self::enhance_image), reporting each forward pass to
    /// `observer`. Resampling without a model reports nothing.
    pub fn enhance_image_with_observer(
        &self,
        image: &BgrImage,
        request: &EnhancementRequest,
        observer: &dyn TileObserver,
    ) -> SrResult<BgrImage> {
        request.validate()?;

        let Some(model) = &self.model else {
            debug!(scale = request.scale, "No model loaded, using bicubic resampling");
            return resize::correct(image, request.scale, 1.0);
        };

        let native = model.native_scale() as usize;
        let (h, w) = (image.height(), image.width());
        let tiles = tiling::plan(h, w, request.patch_size, request.use_patches)?;
        let total = tiles.len();
        observer.on_start(&TiledRun {
            tile_size: if total == 1 { 0 } else { request.patch_size },
            tiles: total,
            width: w,
            height: h,
            scale: model.native_scale(),
        });

        let stitched = if total == 1 {
            observer.on_tile(1, 1, &tiles[0]);
            let output = inference::run(model, image).map_err(|e| {
                observer.on_tile_failed(1, &e);
                e
            })?;
            observer.on_complete(1);
            output
        } else {
            let mut canvas = Canvas::new(h * native, w * native);
            for (i, tile) in tiles.iter().enumerate() {
                let index = i + 1;
                observer.on_tile(index, total, tile);
                let output = inference::run(model, &image.crop(tile)).map_err(|e| {
                    let e = e.at_tile(index);
                    observer.on_tile_failed(index, &e);
                    e
                })?;
                canvas.place(&Placement::whole(tile, native), &output);
            }
            observer.on_complete(total);
            canvas.finish()
        };

        resize::correct(&stitched, request.scale, native as f64)
    }

    /// Decode `input`, enhance it and encode the result to `output` (format
    /// from the extension). Parent directories of `output` are created.
    pub fn enhance_file(
        &self,
        input: &Path,
        output: &Path,
        request: &EnhancementRequest,
    ) -> SrResult<()> {
        let image = read_image(input)?;
        let enhanced = self.enhance_image(&image, request)?;
        write_image(&enhanced, output)?;

        info!(
            input = %input.display(),
            output = %output.display(),
            width = enhanced.width(),
            height = enhanced.height(),
            "Wrote enhanced image"
        );
        Ok(())
    }
}

/// Decode any format the `image` crate recognises into BGR.
pub fn read_image(path: &Path) -> SrResult<BgrImage> {
    let decoded = image::open(path).map_err(|source| SrError::ImageIo {
        path: path.to_path_buf(),
        source,
    })?;
    BgrImage::from_rgb_image(&decoded.to_rgb8())
}

/// Encode by file extension, creating missing parent directories.
pub fn write_image(image: &BgrImage, path: &Path) -> SrResult<()> {
    create_parent_dirs(path)?;
    image
        .to_rgb_image()
        .save(path)
        .map_err(|source| SrError::ImageIo {
            path: path.to_path_buf(),
            source,
        })
}

/// Factory: a facade with `path` already loaded.
pub fn create_super_resolution(path: &Path, device: Option<Device>) -> SrResult<SuperResolution> {
    let mut sr = SuperResolution::new(device);
    sr.load_model(path)?;
    Ok(sr)
}

fn create_parent_dirs(output: &Path) -> SrResult<()> {
    let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(parent).map_err(|e| {
        warn!(dir = %parent.display(), error = %e, "Failed to create output directory");
        SrError::ImageIo {
            path: output.to_path_buf(),
            source: image::ImageError::IoError(e),
        }
    })
}
