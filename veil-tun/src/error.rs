//! Error types for veil-tun

use std::io;
use thiserror::Error;

/// Result type alias for veil-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TUN device operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}
