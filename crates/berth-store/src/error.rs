//! Error types for the resource store.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("an existing file prevents creation of working directory '{0}'")]
    ObstructedDir(PathBuf),
}
