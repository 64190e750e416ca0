use ndarray::{s, Array3, ArrayView3};

use crate::error::{SrError, SrResult};

pub const DEFAULT_SCALE: f64 = 2.0;
pub const DEFAULT_PATCH_SIZE: usize = 300;

/// Dense H×W×3 8-bit image in B,G,R channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgrImage {
    pixels: Array3<u8>,
}

impl BgrImage {
    pub fn new(pixels: Array3<u8>) -> SrResult<Self> {
        let (h, w, c) = pixels.dim();
        if c != 3 {
            return Err(SrError::invalid(format!(
                "image must be HxWx3, got {h}x{w}x{c}"
            )));
        }
        if h == 0 || w == 0 {
            return Err(SrError::invalid(format!("image must not be empty, got {h}x{w}")));
        }
        Ok(Self { pixels })
    }

    pub fn from_raw(height: usize, width: usize, data: Vec<u8>) -> SrResult<Self> {
        let expected = height * width * 3;
        if data.len() != expected {
            return Err(SrError::invalid(format!(
                "data length mismatch: expected {expected} ({height}x{width}x3), got {}",
                data.len()
            )));
        }
        let pixels = Array3::from_shape_vec((height, width, 3), data)
            .map_err(|e| SrError::invalid(format!("failed to shape pixel buffer: {e}")))?;
        Self::new(pixels)
    }

    pub fn solid(height: usize, width: usize, bgr: [u8; 3]) -> Self {
        let pixels = Array3::from_shape_fn((height, width, 3), |(_, _, c)| bgr[c]);
        Self { pixels }
    }

    pub(crate) fn from_array_unchecked(pixels: Array3<u8>) -> Self {
        debug_assert_eq!(pixels.dim().2, 3);
        Self { pixels }
    }

    /// Convert from the `image` crate's RGB buffer at the file IO boundary.
    pub fn from_rgb_image(rgb: &image::RgbImage) -> SrResult<Self> {
        let (width, height) = rgb.dimensions();
        let (w, h) = (width as usize, height as usize);
        let raw = rgb.as_raw();
        let pixels = Array3::from_shape_fn((h, w, 3), |(y, x, c)| raw[(y * w + x) * 3 + (2 - c)]);
        Self::new(pixels)
    }

    pub fn to_rgb_image(&self) -> image::RgbImage {
        let (h, w, _) = self.pixels.dim();
        image::RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            image::Rgb([
                self.pixels[[y, x, 2]],
                self.pixels[[y, x, 1]],
                self.pixels[[y, x, 0]],
            ])
        })
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn pixels(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    pub fn into_pixels(self) -> Array3<u8> {
        self.pixels
    }

    pub fn pixel(&self, y: usize, x: usize) -> [u8; 3] {
        [
            self.pixels[[y, x, 0]],
            self.pixels[[y, x, 1]],
            self.pixels[[y, x, 2]],
        ]
    }

    /// Copy out the source rectangle of `tile`.
    pub fn crop(&self, tile: &Tile) -> Self {
        let view = self.pixels.slice(s![tile.y0..tile.y1, tile.x0..tile.x1, ..]);
        Self {
            pixels: view.to_owned(),
        }
    }
}

/// Source-image rectangle with exclusive upper bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub y0: usize,
    pub x0: usize,
    pub y1: usize,
    pub x1: usize,
}

impl Tile {
    pub fn new(y0: usize, x0: usize, y1: usize, x1: usize) -> Self {
        debug_assert!(y0 < y1 && x0 < x1, "degenerate tile ({y0},{x0})-({y1},{x1})");
        Self { y0, x0, y1, x1 }
    }

    pub fn whole(height: usize, width: usize) -> Self {
        Self::new(0, 0, height, width)
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn area(&self) -> usize {
        self.height() * self.width()
    }

    /// Destination rectangle in a canvas upscaled by `scale`.
    pub fn scaled(&self, scale: usize) -> Self {
        Self {
            y0: self.y0 * scale,
            x0: self.x0 * scale,
            y1: self.y1 * scale,
            x1: self.x1 * scale,
        }
    }

    pub fn contains(&self, y: usize, x: usize) -> bool {
        y >= self.y0 && y < self.y1 && x >= self.x0 && x < self.x1
    }

    pub fn intersects(&self, other: &Tile) -> bool {
        self.y0 < other.y1 && other.y0 < self.y1 && self.x0 < other.x1 && other.x0 < self.x1
    }
}

/// Caller-supplied parameters for one enhancement call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhancementRequest {
    pub scale: f64,
    pub use_patches: bool,
    pub patch_size: usize,
}

impl Default for EnhancementRequest {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            use_patches: true,
            patch_size: DEFAULT_PATCH_SIZE,
        }
    }
}

impl EnhancementRequest {
    pub fn with_scale(scale: f64) -> Self {
        Self {
            scale,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SrResult<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(SrError::invalid(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if self.patch_size == 0 {
            return Err(SrError::invalid("patch_size must be a positive integer"));
        }
        Ok(())
    }
}
