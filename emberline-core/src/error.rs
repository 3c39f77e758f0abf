//! Error types for emberline-core

use thiserror::Error;

/// Main error type for the emberline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Upload blob not found
    #[error("upload blob not found: {0}")]
    BlobNotFound(String),

    /// Uploader/API error
    #[error("upload error: {0}")]
    Upload(String),
}

/// Result type alias for emberline-core
pub type Result<T> = std::result::Result<T, Error>;
