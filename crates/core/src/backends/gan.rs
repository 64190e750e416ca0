//! Real-ESRGAN style upscaling: mod-padding, padded tiles, then resampling
//! to the requested outscale.

use ndarray::Array3;
use tracing::{debug, info};

use super::{BackendKind, SuperResolutionBackend};
use crate::config::GanConfig;
use crate::device::Device;
use crate::error::{SrError, SrResult};
use crate::inference::{self, reflect_index};
use crate::loader::{self, ModelHandle};
use crate::progress::{TileObserver, TiledRun, TracingTileObserver};
use crate::resize::{self, Filter};
use crate::runtime;
use crate::stitch::{Canvas, Placement};
use crate::tiling;
use crate::types::{BgrImage, EnhancementRequest, Tile};
use crate::zoo::ModelZoo;

pub struct GanBackend {
    handle: ModelHandle,
    name: String,
    /// 0 runs the whole image in one pass.
    tile_size: usize,
    tile_pad: usize,
}

impl GanBackend {
    /// Resolve `model_name` in the zoo, make sure its weights are on disk and
    /// load them. GPU devices run untiled; CPU uses `config.cpu_tile_size`.
    pub fn new(
        zoo: &ModelZoo,
        model_name: &str,
        scale: f64,
        device: Device,
        config: &GanConfig,
    ) -> SrResult<Self> {
        if let Err(error) = runtime::onnx_runtime() {
            return Err(SrError::OptionalBackendUnavailable {
                backend: BackendKind::Gan.to_string(),
                source: Box::new(error),
            });
        }

        let descriptor = zoo.resolve(model_name, scale);
        let path = zoo.ensure_weights(&descriptor)?;
        let handle = loader::load_graph(
            &path,
            device,
            descriptor.native_scale,
            descriptor.layout,
            &BackendKind::Gan.to_string(),
        )?;

        let tile_size = if device.is_gpu() {
            0
        } else {
            config.cpu_tile_size
        };
        info!(
            model = %descriptor.name,
            arch = %descriptor.arch,
            native_scale = descriptor.native_scale,
            device = %device,
            tile_size,
            tile_pad = config.tile_pad,
            "GAN backend ready"
        );

        Ok(Self {
            handle,
            name: descriptor.name,
            tile_size,
            tile_pad: config.tile_pad,
        })
    }

    pub fn from_handle(
        name: impl Into<String>,
        handle: ModelHandle,
        tile_size: usize,
        tile_pad: usize,
    ) -> Self {
        Self {
            handle,
            name: name.into(),
            tile_size,
            tile_pad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn native_scale(&self) -> u32 {
        self.handle.native_scale()
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn enhance_with_observer(
        &self,
        image: &BgrImage,
        outscale: f64,
        observer: &dyn TileObserver,
    ) -> SrResult<BgrImage> {
        if !(outscale.is_finite() && outscale > 0.0) {
            return Err(SrError::invalid(format!(
                "outscale must be a positive number, got {outscale}"
            )));
        }
        if image.height() == 0 || image.width() == 0 {
            return Err(SrError::invalid("cannot upscale an empty image"));
        }

        let native = self.handle.native_scale() as usize;
        let (h, w) = (image.height(), image.width());
        let padded = mod_pad(image, mod_scale(native));
        let (ph, pw) = (padded.height(), padded.width());

        let output = if self.tile_size == 0 {
            self.whole_process(&padded, observer)?
        } else {
            self.tile_process(&padded, observer)?
        };

        let output = if (ph, pw) == (h, w) {
            output
        } else {
            output.crop(&Tile::whole(h * native, w * native))
        };
        Ok(apply_outscale(output, h, w, outscale, native))
    }

    fn whole_process(&self, image: &BgrImage, observer: &dyn TileObserver) -> SrResult<BgrImage> {
        let region = Tile::whole(image.height(), image.width());
        observer.on_start(&self.run_info(image, 1));
        observer.on_tile(1, 1, &region);
        let output = inference::run(&self.handle, image).map_err(|e| {
            observer.on_tile_failed(1, &e);
            e
        })?;
        observer.on_complete(1);
        Ok(output)
    }

    /// Real-ESRGAN `tile_process`: each padded tile is inferred and its
    /// centre written straight into the output canvas.
    fn tile_process(&self, image: &BgrImage, observer: &dyn TileObserver) -> SrResult<BgrImage> {
        let native = self.handle.native_scale() as usize;
        let (h, w) = (image.height(), image.width());
        let tiles = tiling::plan_padded(h, w, self.tile_size, self.tile_pad)?;
        let total = tiles.len();
        observer.on_start(&self.run_info(image, total));

        let mut canvas = Canvas::new(h * native, w * native);
        for tile in &tiles {
            observer.on_tile(tile.index, total, &tile.input);
            let output = inference::run(&self.handle, &image.crop(&tile.padded)).map_err(|e| {
                let e = e.at_tile(tile.index);
                observer.on_tile_failed(tile.index, &e);
                e
            })?;
            canvas.place(&Placement::from_padded(tile, native), &output);
        }

        observer.on_complete(total);
        Ok(canvas.finish())
    }

    fn run_info(&self, image: &BgrImage, tiles: usize) -> TiledRun {
        TiledRun {
            tile_size: self.tile_size,
            tiles,
            width: image.width(),
            height: image.height(),
            scale: self.handle.native_scale(),
        }
    }
}

impl SuperResolutionBackend for GanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gan
    }

    fn enhance(&self, image: &BgrImage, request: &EnhancementRequest) -> SrResult<BgrImage> {
        self.enhance_with_observer(image, request.scale, &TracingTileObserver)
    }

    fn enhance_with_progress(
        &self,
        image: &BgrImage,
        request: &EnhancementRequest,
        observer: &dyn TileObserver,
    ) -> SrResult<BgrImage> {
        self.enhance_with_observer(image, request.scale, observer)
    }
}

/// Upscale with zoo model `model_name` from `models/`, resampled to `scale`.
pub fn enhance(
    image: &BgrImage,
    model_name: &str,
    scale: f64,
    device: Option<Device>,
) -> SrResult<BgrImage> {
    let mut zoo = ModelZoo::with_builtin_models("models".into());
    if let Err(error) = zoo.discover() {
        debug!(error = %format!("{error:#}"), "Model discovery failed");
    }
    let backend = GanBackend::new(
        &zoo,
        model_name,
        scale,
        Device::resolve(device),
        &GanConfig::default(),
    )?;
    backend.enhance_with_observer(image, scale, &TracingTileObserver)
}

/// Real-ESRGAN outscale: truncate `h × outscale`, `w × outscale` and
/// resample with Lanczos4, unless `outscale` is the native scale.
fn apply_outscale(output: BgrImage, h: usize, w: usize, outscale: f64, native: usize) -> BgrImage {
    if resize::is_close(outscale, native as f64) {
        return output;
    }
    let out_h = ((h as f64 * outscale) as usize).max(1);
    let out_w = ((w as f64 * outscale) as usize).max(1);
    debug!(outscale, native, out_h, out_w, "Resampling to outscale");
    resize::resize_to(&output, out_h, out_w, Filter::Lanczos4)
}

/// Alignment the network input needs: x2 models unshuffle by 2, x1 by 4.
fn mod_scale(native: usize) -> usize {
    match native {
        2 => 2,
        1 => 4,
        _ => 1,
    }
}

/// Reflect-pad bottom and right so both sides are multiples of `align`.
fn mod_pad(image: &BgrImage, align: usize) -> BgrImage {
    let (h, w) = (image.height(), image.width());
    let pad_h = (align - h % align) % align;
    let pad_w = (align - w % align) % align;
    if pad_h == 0 && pad_w == 0 {
        return image.clone();
    }

    let pixels = image.pixels();
    let padded = Array3::from_shape_fn((h + pad_h, w + pad_w, 3), |(y, x, c)| {
        pixels[[reflect_index(y, h), reflect_index(x, w), c]]
    });
    BgrImage::from_array_unchecked(padded)
}
