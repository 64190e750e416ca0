//! Tile scheduling for bounded-memory inference.

use crate::error::{SrError, SrResult};
use crate::types::Tile;

/// Split an `height × width` image into row-major, non-overlapping tiles of
/// at most `patch_size` per side.
///
/// A single whole-image tile is returned when tiling is disabled or the image
/// already fits.
pub fn plan(
    height: usize,
    width: usize,
    patch_size: usize,
    use_patches: bool,
) -> SrResult<Vec<Tile>> {
    if patch_size == 0 {
        return Err(SrError::invalid("patch_size must be a positive integer"));
    }
    if height == 0 || width == 0 {
        return Err(SrError::invalid(format!(
            "cannot tile an empty {height}x{width} image"
        )));
    }

    if !use_patches || height.max(width) <= patch_size {
        return Ok(vec![Tile::whole(height, width)]);
    }

    let mut tiles = Vec::with_capacity(height.div_ceil(patch_size) * width.div_ceil(patch_size));
    for y0 in (0..height).step_by(patch_size) {
        let y1 = (y0 + patch_size).min(height);
        for x0 in (0..width).step_by(patch_size) {
            let x1 = (x0 + patch_size).min(width);
            tiles.push(Tile::new(y0, x0, y1, x1));
        }
    }
    Ok(tiles)
}

/// One tile of the GAN scheduler: the region it owns plus the context it is
/// inferred with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddedTile {
    /// 1-based, row-major.
    pub index: usize,
    /// Region of the source image this tile contributes to the output.
    pub input: Tile,
    /// `input` grown by the tile pad on every side, clamped to the image.
    pub padded: Tile,
}

impl PaddedTile {
    /// Destination rectangle in the upscaled canvas.
    pub fn output_rect(&self, scale: usize) -> Tile {
        self.input.scaled(scale)
    }

    /// Rectangle of the padded tile's output that belongs to `input`.
    pub fn crop_rect(&self, scale: usize) -> Tile {
        let y0 = (self.input.y0 - self.padded.y0) * scale;
        let x0 = (self.input.x0 - self.padded.x0) * scale;
        Tile {
            y0,
            x0,
            y1: y0 + self.input.height() * scale,
            x1: x0 + self.input.width() * scale,
        }
    }
}

/// Tile geometry of Real-ESRGAN's `tile_process`: `ceil(W/tile) ×
/// ceil(H/tile)` tiles, each padded by `tile_pad` on all sides and clamped
/// to the image.
pub fn plan_padded(
    height: usize,
    width: usize,
    tile_size: usize,
    tile_pad: usize,
) -> SrResult<Vec<PaddedTile>> {
    if tile_size == 0 {
        return Err(SrError::invalid("tile_size must be a positive integer"));
    }
    if height == 0 || width == 0 {
        return Err(SrError::invalid(format!(
            "cannot tile an empty {height}x{width} image"
        )));
    }

    let tiles_x = width.div_ceil(tile_size);
    let tiles_y = height.div_ceil(tile_size);

    let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            let start_x = x * tile_size;
            let start_y = y * tile_size;
            let end_x = (start_x + tile_size).min(width);
            let end_y = (start_y + tile_size).min(height);

            let input = Tile::new(start_y, start_x, end_y, end_x);
            let padded = Tile::new(
                start_y.saturating_sub(tile_pad),
                start_x.saturating_sub(tile_pad),
                (end_y + tile_pad).min(height),
                (end_x + tile_pad).min(width),
            );

            tiles.push(PaddedTile {
                index: y * tiles_x + x + 1,
                input,
                padded,
            });
        }
    }
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_single_tile_when_image_fits() {
        let tiles = plan(300, 200, 300, true).unwrap();
        assert_eq!(tiles, vec![Tile::whole(300, 200)]);
    }

    #[test]
    fn test_plan_single_tile_when_disabled() {
        let tiles = plan(1000, 1000, 300, false).unwrap();
        assert_eq!(tiles, vec![Tile::whole(1000, 1000)]);
    }

    #[test]
    fn test_plan_row_major_with_ragged_edges() {
        let tiles = plan(400, 700, 300, true).unwrap();
        assert_eq!(
            tiles,
            vec![
                Tile::new(0, 0, 300, 300),
                Tile::new(0, 300, 300, 600),
                Tile::new(0, 600, 300, 700),
                Tile::new(300, 0, 400, 300),
                Tile::new(300, 300, 400, 600),
                Tile::new(300, 600, 400, 700),
            ]
        );
    }

    #[test]
    fn test_plan_partitions_image() {
        let (h, w) = (517, 233);
        let tiles = plan(h, w, 64, true).unwrap();
        let area: usize = tiles.iter().map(Tile::area).sum();
        assert_eq!(area, h * w);
        for (i, a) in tiles.iter().enumerate() {
            assert!(a.y1 <= h && a.x1 <= w);
            for b in &tiles[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_plan_rejects_zero_patch_size() {
        let err = plan(10, 10, 0, true).unwrap_err();
        assert!(matches!(err, SrError::InvalidRequest(_)));
    }

    #[test]
    fn test_plan_padded_geometry() {
        // 600x500 image, 256 tiles, pad 10: 2 columns x 3 rows.
        let tiles = plan_padded(600, 500, 256, 10).unwrap();
        assert_eq!(tiles.len(), 6);
        assert_eq!(
            tiles.iter().map(|t| t.index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );

        let first = tiles[0];
        assert_eq!(first.input, Tile::new(0, 0, 256, 256));
        assert_eq!(first.padded, Tile::new(0, 0, 266, 266));
        assert_eq!(first.crop_rect(4), Tile::new(0, 0, 1024, 1024));

        let second = tiles[1];
        assert_eq!(second.input, Tile::new(0, 256, 256, 500));
        assert_eq!(second.padded, Tile::new(0, 246, 266, 500));
        assert_eq!(second.output_rect(4), Tile::new(0, 1024, 1024, 2000));
        assert_eq!(second.crop_rect(4), Tile::new(0, 40, 1024, 1016));

        let last = tiles[5];
        assert_eq!(last.input, Tile::new(512, 256, 600, 500));
        assert_eq!(last.padded, Tile::new(502, 246, 600, 500));
        assert_eq!(last.crop_rect(2), Tile::new(20, 20, 196, 508));
    }

    #[test]
    fn test_plan_padded_covers_canvas() {
        let tiles = plan_padded(300, 257, 128, 10).unwrap();
        let area: usize = tiles.iter().map(|t| t.output_rect(4).area()).sum();
        assert_eq!(area, 300 * 4 * 257 * 4);
    }
}
