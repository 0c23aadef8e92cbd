//! Error types for volplay_core.

use thiserror::Error;

/// Errors returned by a volume provider or its storage source.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("Provider does not support {0}")]
    Unsupported(&'static str),

    #[error("Volume not found: layer={layer_key}, timepoint={timepoint}")]
    NotFound { layer_key: String, timepoint: u32 },

    #[error("Failed to load {layer_key}@{timepoint}: {reason}")]
    Load {
        layer_key: String,
        timepoint: u32,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Whether this error only reflects a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised while building or configuring a scheduler.
#[derive(Error, Debug)]
pub enum PrefetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid config: {0}")]
    Config(String),
}

/// Result type alias for scheduler construction and configuration.
pub type PrefetchResult<T> = Result<T, PrefetchError>;
