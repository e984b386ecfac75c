/*!
Error types for the modvault core engine.
*/

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout the modvault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur during registry, soundpack and snapshot operations.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Malformed or incomplete package source, or an invalid request
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced package, file or snapshot does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Read/write/copy/archive I/O failure, tagged with the offending path
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Registry and filesystem disagree in a way that prevents safe completion
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Embedded registry store errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Zip archive errors
    #[error("Archive error at {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid layout configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Tag an I/O error with the path it happened on
    pub fn io<P: AsRef<Path>>(path: P, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Tag an archive error with the archive path
    pub fn archive<P: AsRef<Path>>(path: P, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Map a store error, turning constraint violations into integrity errors
    pub(crate) fn from_store(err: rusqlite::Error, context: &str) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(format!("{context}: {err}"))
            }
            other => Self::Database(other),
        }
    }

    /// True for errors caused by the caller's input rather than the environment
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Extension for attaching a path to `std::io::Result`s
pub(crate) trait IoResultExt<T> {
    fn at_path<P: AsRef<Path>>(self, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path<P: AsRef<Path>>(self, path: P) -> Result<T> {
        self.map_err(|source| VaultError::io(path, source))
    }
}
