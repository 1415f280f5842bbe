//! Error types for image persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while writing generated images.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no images to save")]
    Empty,

    #[error("image {index} is not valid base64: {message}")]
    Decode { index: usize, message: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
