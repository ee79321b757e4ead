//! Filesystem status codes returned across the filter callback boundary.

use std::fmt;

use rusty_projection_vfs::VfsError;

/// Status code handed back to the host for one callback.
///
/// Codes follow the NTSTATUS values the host filter mechanism expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation completed.
    Success,
    /// Target path does not exist.
    ObjectNameNotFound,
    /// Destination already has an entry.
    ObjectNameCollision,
    /// Directory still has children.
    DirectoryNotEmpty,
    /// Operation not permitted (includes sharing violations and pending deletes).
    AccessDenied,
    /// Caller buffer cannot hold a single entry.
    BufferTooSmall,
    /// Placeholder metadata is unreadable; the path is inaccessible.
    FileCorrupt,
    /// Content could not be fetched from the backing store.
    IoDevice,
    /// Backing store moved to a newer epoch than a refresh could catch up with.
    FileInvalid,
    /// Concurrent updates kept winning; the caller may retry.
    DeviceBusy,
    /// Path refers to a file where a directory was required.
    NotADirectory,
    /// Path refers to a directory where a file was required.
    FileIsADirectory,
    /// Malformed path or argument.
    InvalidParameter,
    /// Handle is unknown or already closed.
    InvalidHandle,
    /// Operation was cancelled by the host.
    Cancelled,
    /// Persistence or local I/O failure.
    InternalError,
}

impl Status {
    /// NTSTATUS value for this status.
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0x0000_0000,
            Status::ObjectNameNotFound => 0xC000_0034,
            Status::ObjectNameCollision => 0xC000_0035,
            Status::DirectoryNotEmpty => 0xC000_0101,
            Status::AccessDenied => 0xC000_0022,
            Status::BufferTooSmall => 0xC000_0023,
            Status::FileCorrupt => 0xC000_0102,
            Status::IoDevice => 0xC000_0185,
            Status::FileInvalid => 0xC000_0098,
            Status::DeviceBusy => 0x8000_0011,
            Status::NotADirectory => 0xC000_0103,
            Status::FileIsADirectory => 0xC000_00BA,
            Status::InvalidParameter => 0xC000_000D,
            Status::InvalidHandle => 0xC000_0008,
            Status::Cancelled => 0xC000_0120,
            Status::InternalError => 0xC000_00E5,
        }
    }

    /// Check if this is the success status.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Status of a callback result.
    pub fn of<T>(result: &Result<T, Status>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(status) => *status,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.code())
    }
}

impl std::error::Error for Status {}

impl From<&VfsError> for Status {
    fn from(e: &VfsError) -> Self {
        match e {
            VfsError::PathNotFound(_) => Status::ObjectNameNotFound,
            VfsError::DestinationExists(_) => Status::ObjectNameCollision,
            VfsError::DirectoryNotEmpty(_) => Status::DirectoryNotEmpty,
            VfsError::AccessDenied(_) | VfsError::DeletePending(_) => Status::AccessDenied,
            VfsError::StaleEpoch { .. } => Status::FileInvalid,
            VfsError::ContentUnavailable { .. } | VfsError::Timeout(_) => Status::IoDevice,
            VfsError::MalformedMetadata(_) | VfsError::SchemaMismatch { .. } => {
                Status::FileCorrupt
            }
            VfsError::BufferTooSmall { .. } => Status::BufferTooSmall,
            VfsError::LostRace(_) => Status::DeviceBusy,
            VfsError::NotADirectory(_) => Status::NotADirectory,
            VfsError::IsADirectory(_) => Status::FileIsADirectory,
            VfsError::InvalidPath(_) | VfsError::RangeOutOfBounds { .. } => {
                Status::InvalidParameter
            }
            VfsError::Cancelled => Status::Cancelled,
            VfsError::Journal(_) | VfsError::LayoutVersion { .. } | VfsError::Io(_) => {
                Status::InternalError
            }
        }
    }
}

impl From<VfsError> for Status {
    fn from(e: VfsError) -> Self {
        Status::from(&e)
    }
}
