//! Filter callback dispatcher for projected working trees.
//!
//! The host filter mechanism (ProjFS-style) invokes one callback per file
//! operation. [`Dispatcher`] routes each callback to the per-path state
//! machine in `rusty_projection_vfs`, keeps per-handle context, and reports
//! a [`Status`] back to the host.
//!
//! # Architecture
//!
//! ```text
//! Host callbacks ──► Dispatcher ──► LockManager (path + parent)
//!                       │               │
//!                       │               ▼
//!                       │         StateStore / DirectoryOverlays / LocalStore
//!                       │               │
//!                       │               ▼
//!                       │         Materializer, EnumerationMerger ──► BackingStore
//!                       ▼
//!                 HandleTable, BackgroundTaskRunner ──► ModifiedPathsDatabase
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rusty_projection_filter::{Dispatcher, FilterOptions, OpenOptions};
//!
//! let dispatcher = Dispatcher::new(FilterOptions::new(root), backing)?;
//! let handle = dispatcher.on_create(&VirtualPath::new("src/main.rs")?, OpenOptions::read())?;
//! let data = dispatcher.on_read(handle, 0, 4096)?;
//! dispatcher.on_close(handle)?;
//! ```

pub mod background;
pub mod dispatcher;
pub mod error;
pub mod handles;
pub mod modified_paths;
pub mod options;
pub mod stats;
pub mod status;

pub use background::{BackgroundTask, BackgroundTaskRunner};
pub use dispatcher::{Destination, Dispatcher, EnumerationReply, FileAttributes};
pub use error::FilterError;
pub use handles::{
    AccessMask, CreateDisposition, DeleteDisposition, HandleId, OpenOptions, OperationContext,
};
pub use modified_paths::{ModificationSummary, ModifiedPathsDatabase};
pub use options::{FilterOptions, NotificationMask};
pub use stats::{FilterStats, FilterStatsCollector};
pub use status::Status;
