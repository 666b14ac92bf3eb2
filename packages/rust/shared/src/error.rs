//! Error types for burnwatch.
//!
//! Library crates use [`BurnwatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all burnwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum BurnwatchError {
    /// Invalid or missing configuration, including an unresolvable area of interest.
    #[error("config error: {message}")]
    Config { message: String },

    /// Failure talking to the imagery catalog, job service, or file store.
    #[error("remote service error: {0}")]
    Remote(String),

    /// Raster decode/encode failure.
    #[error("raster error at {path:?}: {message}")]
    Raster { path: PathBuf, message: String },

    /// Result store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Training or inference engine failure.
    #[error("model error: {0}")]
    Model(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed table or dataset.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BurnwatchError>;

impl BurnwatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a remote service error from any displayable message.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a raster error for `path`.
    pub fn raster(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Raster {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a storage error from any displayable message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a model error from any displayable message.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = BurnwatchError::config("missing area of interest");
        assert_eq!(err.to_string(), "config error: missing area of interest");
        assert!(err.is_config());

        let err = BurnwatchError::raster("data/raw/t.tif", "unsupported sample format");
        assert!(err.to_string().contains("unsupported sample format"));
        assert!(!err.is_config());
    }
}
