//! Error types for the projection VFS crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during virtualization operations.
///
/// The first group mirrors the filesystem-visible taxonomy; the rest are
/// infrastructure failures that the filter layer reports as internal errors.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path (or one of its intermediate directories) does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Rename destination already has an entry.
    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Operation is not permitted for this path or handle.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Backing store holds a newer epoch than the placeholder records.
    #[error("Stale epoch for {path}: recorded {recorded}, backing store has {current}")]
    StaleEpoch {
        /// Path whose placeholder is stale.
        path: String,
        /// Epoch recorded in the placeholder metadata.
        recorded: u64,
        /// Epoch reported by the backing store.
        current: u64,
    },

    /// Content could not be fetched from the backing store.
    #[error("Content unavailable for {path}: {reason}")]
    ContentUnavailable {
        /// Path being materialized.
        path: String,
        /// Why the fetch failed.
        reason: String,
    },

    /// Reparse metadata record is truncated or has an unknown format.
    #[error("Malformed placeholder metadata: {0}")]
    MalformedMetadata(String),

    /// Content id length does not match the backing store's scheme.
    #[error("Content id schema mismatch: expected {expected} bytes, got {actual}")]
    SchemaMismatch {
        /// Digest length used by the backing store.
        expected: usize,
        /// Digest length found.
        actual: usize,
    },

    /// A single enumeration entry does not fit in an empty page.
    #[error("Buffer too small: entry needs {required} bytes, page has {available}")]
    BufferTooSmall {
        /// Bytes needed for the smallest pending entry.
        required: usize,
        /// Bytes offered by the caller.
        available: usize,
    },

    /// Compare-and-set observed a different state than expected.
    #[error("Lost race on {0}")]
    LostRace(String),

    /// Path is marked for deletion and cannot be opened.
    #[error("Delete pending: {0}")]
    DeletePending(String),

    /// Operation requires a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Operation requires a file.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Offset or length outside what local content can hold.
    #[error("Range out of bounds for {path}: offset {offset}, length {len}")]
    RangeOutOfBounds {
        /// Path being written.
        path: String,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
    },

    /// Path cannot be normalized.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Operation did not finish before its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Persisted journal could not be decoded.
    #[error("Journal error: {0}")]
    Journal(String),

    /// Persisted state was written by an incompatible layout version.
    #[error("Unsupported layout version: expected {expected}, found {found}")]
    LayoutVersion {
        /// Version this build reads.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// True when retrying the operation with fresh reads may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VfsError::LostRace(_) | VfsError::Timeout(_))
    }

    /// True when the error means the path's persisted identity is corrupt.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VfsError::MalformedMetadata(_) | VfsError::SchemaMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for VfsError {
    fn from(e: serde_json::Error) -> Self {
        VfsError::Journal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_path() {
        let err = VfsError::PathNotFound("dir/file.txt".to_string());
        assert_eq!(err.to_string(), "Path not found: dir/file.txt");
    }

    #[test]
    fn test_transient_classification() {
        assert!(VfsError::LostRace("a".to_string()).is_transient());
        assert!(VfsError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!VfsError::Cancelled.is_transient());
        assert!(!VfsError::PathNotFound("a".to_string()).is_transient());
    }

    #[test]
    fn test_corruption_classification() {
        assert!(VfsError::MalformedMetadata("short".to_string()).is_corruption());
        assert!(VfsError::SchemaMismatch {
            expected: 20,
            actual: 32
        }
        .is_corruption());
        assert!(!VfsError::LostRace("a".to_string()).is_corruption());
    }
}
