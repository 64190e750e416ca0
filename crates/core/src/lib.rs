//! Core crate for tiled neural image upscaling.

pub mod backends;
pub mod config;
pub mod device;
pub mod error;
pub mod facade;
pub mod inference;
pub mod loader;
pub mod logging;
pub mod nn;
pub mod progress;
pub mod resize;
pub mod runtime;
pub mod stitch;
pub mod tiling;
pub mod types;
pub mod zoo;

pub use device::Device;
pub use error::{SrError, SrResult};
pub use facade::{create_super_resolution, SuperResolution};
pub use types::{BgrImage, EnhancementRequest, Tile};
