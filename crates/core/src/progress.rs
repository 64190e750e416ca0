//! Progress reporting for tiled inference.

use tracing::{debug, error, info};

use crate::error::SrError;
use crate::types::Tile;

/// Shape of a tiled run, reported once before the first tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledRun {
    /// Tile edge in source pixels; 0 means the whole image in one pass.
    pub tile_size: usize,
    pub tiles: usize,
    pub width: usize,
    pub height: usize,
    pub scale: u32,
}

/// Callbacks for tiled inference. Indices are 1-based and row-major.
pub trait TileObserver {
    fn on_start(&self, _run: &TiledRun) {}

    /// Called before the tile's forward pass. `region` is the part of the
    /// source image the tile contributes, without pad context.
    fn on_tile(&self, _index: usize, _total: usize, _region: &Tile) {}

    fn on_tile_failed(&self, _index: usize, _error: &SrError) {}

    fn on_complete(&self, _total: usize) {}
}

/// Reports progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTileObserver;

impl TileObserver for TracingTileObserver {
    fn on_start(&self, run: &TiledRun) {
        info!(
            tile_size = run.tile_size,
            tiles = run.tiles,
            width = run.width,
            height = run.height,
            scale = run.scale,
            "Tiled inference start"
        );
    }

    fn on_tile(&self, index: usize, total: usize, region: &Tile) {
        debug!(
            "Tile {index}/{total} (x:{}-{}, y:{}-{})",
            region.x0, region.x1, region.y0, region.y1
        );
    }

    fn on_tile_failed(&self, index: usize, error: &SrError) {
        error!(tile = index, error = %error, "Tile failed");
    }

    fn on_complete(&self, total: usize) {
        debug!(tiles = total, "Tiled inference complete");
    }
}
