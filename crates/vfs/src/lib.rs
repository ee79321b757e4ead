//! Per-path virtualization state for projected working trees.
//!
//! A large backing object store is projected into a working directory as if
//! every file already existed locally; content is fetched on first real
//! access. This crate holds the platform-neutral pieces the filter layer
//! drives.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: Materializer, EnumerationMerger, LockManager
//! Layer 2: StateStore (+ Journal), DirectoryOverlays, LocalStore, BackingStore
//! Layer 1: VirtualPath, PathState machine, reparse metadata codec
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rusty_projection_vfs::{PersistentState, VirtualPath};
//!
//! let state = PersistentState::open(Path::new("/var/lib/projection"))?;
//! let entry = state.store.get(&VirtualPath::new("src/main.rs")?);
//! ```

pub mod backing;
pub mod compare;
pub mod enumeration;
pub mod error;
pub mod executor;
pub mod journal;
pub mod local;
pub mod lock;
pub mod materializer;
pub mod metadata;
pub mod overlay;
pub mod path;
pub mod state;
pub mod store;
pub mod wildcard;

pub use error::VfsError;

pub use backing::{BackingEntry, BackingStore, FetchError, MemoryBackingStore};
pub use enumeration::{
    ContinuationToken, DirEntry, EnumerationMerger, EnumerationPage, ListingSource,
    DEFAULT_ENTRY_HEADER_SIZE,
};
pub use executor::{AsyncExecutor, ExecutorConfig, ExecutorError};
pub use journal::{Journal, JournalRecord, LAYOUT_VERSION};
pub use local::{DiskLocalStore, LocalStore, MemoryLocalStore};
pub use lock::{LockManager, PathGuard};
pub use materializer::Materializer;
pub use metadata::{ContentId, PlaceholderVersion, ReparseRecord, CONTENT_ID_LEN, RECORD_SIZE};
pub use overlay::{DirectoryOverlay, DirectoryOverlays, OverlayChild};
pub use path::VirtualPath;
pub use state::{next_state, PathEntry, PathState, Transition};
pub use store::{PathStateStore, PersistentState, StateStore};

pub use tokio_util::sync::CancellationToken;
