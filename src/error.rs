use std::path::PathBuf;

use thiserror::Error;

use crate::selection::Attempt;

/// Errors produced by the cropping pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum CropError {
    #[error("failed to load image {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to save image {path:?}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no valid crop boundaries found ({} methods attempted)", attempts.len())]
    NoValidBoundary { attempts: Vec<Attempt> },

    #[error("degenerate crop result: {width}x{height}")]
    DegenerateResult { width: u32, height: u32 },

    #[error("background leveling failed: {0}")]
    Leveling(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CropError {
    /// Diagnostic trail for a failed boundary search, empty for other errors.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            CropError::NoValidBoundary { attempts } => attempts,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, CropError>;
