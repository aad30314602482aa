#![forbid(unsafe_code)]

use crate::engine::EngineError;
use thiserror::Error;

/// Failures surfaced to HTTP clients. Engine text is passed through as-is.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A required parameter is missing.
    #[error("{0}")]
    Validation(String),

    #[error("Failed to extract info: {0}")]
    Extraction(#[source] EngineError),

    #[error("Download failed: {0}")]
    Download(#[source] EngineError),

    #[error("Download completed but file not found")]
    FileNotFound,

    #[error("Could not prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("Could not read downloaded file: {0}")]
    Read(#[source] std::io::Error),
}

impl FetchError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
