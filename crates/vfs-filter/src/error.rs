//! Setup and configuration errors for the filter layer.
//!
//! Per-callback failures are reported as [`crate::Status`] values; these
//! errors cover building and tearing down a [`crate::Dispatcher`].

use std::path::PathBuf;

use rusty_projection_vfs::VfsError;
use thiserror::Error;

/// Errors that can occur while configuring or starting the filter.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Error from the state primitives.
    #[error("VFS error: {0}")]
    Vfs(#[from] VfsError),

    /// Virtualization root path is unusable.
    #[error("Invalid virtualization root path: {}", .0.display())]
    InvalidRootPath(PathBuf),

    /// Options file could not be parsed.
    #[error("Invalid options: {0}")]
    Config(String),

    /// Background worker could not be started.
    #[error("Failed to start background worker: {0}")]
    Worker(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for FilterError {
    fn from(e: serde_json::Error) -> Self {
        FilterError::Config(e.to_string())
    }
}
