//! Reassembles per-tile outputs into one canvas.

use ndarray::{s, Array3};
#[cfg(debug_assertions)]
use ndarray::Array2;

use crate::tiling::PaddedTile;
use crate::types::{BgrImage, Tile};

/// Where a tile output lands: `dest` in the canvas, filled from the
/// same-sized region of the output starting at `(src_y, src_x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub dest: Tile,
    pub src_y: usize,
    pub src_x: usize,
}

impl Placement {
    /// The whole tile output goes to the scaled tile rectangle.
    pub fn whole(tile: &Tile, scale: usize) -> Self {
        Self {
            dest: tile.scaled(scale),
            src_y: 0,
            src_x: 0,
        }
    }

    /// Drop the pad context from a padded tile's output.
    pub fn from_padded(tile: &PaddedTile, scale: usize) -> Self {
        let crop = tile.crop_rect(scale);
        Self {
            dest: tile.output_rect(scale),
            src_y: crop.y0,
            src_x: crop.x0,
        }
    }
}

/// Output canvas that tiles are written into as they are produced.
///
/// Placements must partition the canvas. Bounds and too-small outputs are
/// checked on every [`place`](Self::place); overlaps are tracked with a
/// coverage mask in debug builds; [`finish`](Self::finish) checks that the
/// placed area adds up to the canvas.
pub struct Canvas {
    pixels: Array3<u8>,
    covered: usize,
    #[cfg(debug_assertions)]
    mask: Array2<bool>,
}

impl Canvas {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            pixels: Array3::zeros((height, width, 3)),
            covered: 0,
            #[cfg(debug_assertions)]
            mask: Array2::from_elem((height, width), false),
        }
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    /// Copy the placement's region of `output` into the canvas.
    ///
    /// # Panics
    ///
    /// When the destination leaves the canvas, when `output` is too small
    /// for the placement, or (debug builds) when it overlaps an earlier one.
    pub fn place(&mut self, placement: &Placement, output: &BgrImage) {
        let dest = placement.dest;
        let (canvas_h, canvas_w) = (self.height(), self.width());
        assert!(
            dest.y0 < dest.y1 && dest.x0 < dest.x1 && dest.y1 <= canvas_h && dest.x1 <= canvas_w,
            "placement {dest:?} is outside the {canvas_h}x{canvas_w} canvas"
        );
        let (src_y1, src_x1) = (
            placement.src_y + dest.height(),
            placement.src_x + dest.width(),
        );
        assert!(
            src_y1 <= output.height() && src_x1 <= output.width(),
            "tile output {}x{} too small for placement {placement:?}",
            output.height(),
            output.width()
        );

        #[cfg(debug_assertions)]
        {
            let mut region = self.mask.slice_mut(s![dest.y0..dest.y1, dest.x0..dest.x1]);
            assert!(
                region.iter().all(|taken| !taken),
                "placement {dest:?} overlaps an earlier placement"
            );
            region.fill(true);
        }

        let src = output
            .pixels()
            .slice_move(s![placement.src_y..src_y1, placement.src_x..src_x1, ..]);
        self.pixels
            .slice_mut(s![dest.y0..dest.y1, dest.x0..dest.x1, ..])
            .assign(&src);
        self.covered += dest.area();
    }

    /// # Panics
    ///
    /// When the placements left gaps.
    pub fn finish(self) -> BgrImage {
        let (canvas_h, canvas_w) = (self.height(), self.width());
        assert_eq!(
            self.covered,
            canvas_h * canvas_w,
            "placements leave gaps in the {canvas_h}x{canvas_w} canvas"
        );
        BgrImage::from_array_unchecked(self.pixels)
    }
}
