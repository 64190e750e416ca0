//! Error taxonomy surfaced by the upscaling engine.
//!
//! Internal plumbing (ONNX Runtime calls, file IO) keeps using
//! `anyhow::Result` with context strings; everything that crosses the facade
//! or a backend boundary is converted into [`SrError`] so callers can match
//! on the failure class.

use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type SrResult<T> = std::result::Result<T, SrError>;

#[derive(Debug, Error)]
pub enum SrError {
    #[error("model artifact not found: {}{}", path.display(), format_hint(hint))]
    ArtifactNotFound { path: PathBuf, hint: Option<String> },

    #[error("unsupported model artifact {}: {detail}", path.display())]
    UnsupportedArtifactFormat { path: PathBuf, detail: String },

    #[error("backend '{backend}' is unavailable")]
    OptionalBackendUnavailable {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("inference failed{}", format_tile(*tile_index))]
    InferenceFailure {
        tile_index: Option<usize>,
        #[source]
        source: BoxError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("image IO failed for {}", path.display())]
    ImageIo {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl SrError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn inference(source: impl Into<BoxError>) -> Self {
        Self::InferenceFailure {
            tile_index: None,
            source: source.into(),
        }
    }

    /// Attach a 1-based tile index to an inference failure. Other variants
    /// pass through unchanged.
    pub fn at_tile(self, index: usize) -> Self {
        match self {
            Self::InferenceFailure { source, .. } => Self::InferenceFailure {
                tile_index: Some(index),
                source,
            },
            other => other,
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::UnsupportedArtifactFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

fn format_hint(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!(" ({hint})"),
        None => String::new(),
    }
}

fn format_tile(tile_index: Option<usize>) -> String {
    match tile_index {
        Some(index) => format!(" on tile {index}"),
        None => String::new(),
    }
}
