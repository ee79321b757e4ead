//! Open handles and their per-handle operation context.
//!
//! The table hands out `Arc`s to each context. Callers collect the handles
//! they need first and lock each context afterwards, never while a table
//! guard is alive.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rusty_projection_vfs::{ContinuationToken, VfsError, VirtualPath};
use tokio_util::sync::CancellationToken;

use crate::status::Status;

/// Identifies one open file instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Raw handle value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Access rights, also used for share modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessMask {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl AccessMask {
    pub const NONE: AccessMask = AccessMask {
        read: false,
        write: false,
        delete: false,
    };
    pub const READ: AccessMask = AccessMask {
        read: true,
        write: false,
        delete: false,
    };
    pub const READ_WRITE: AccessMask = AccessMask {
        read: true,
        write: true,
        delete: false,
    };
    pub const ALL: AccessMask = AccessMask {
        read: true,
        write: true,
        delete: true,
    };

    /// Copy with delete added.
    pub fn with_delete(self) -> Self {
        Self {
            delete: true,
            ..self
        }
    }

    /// Check whether every right in `access` is allowed by this share mode.
    pub fn permits(self, access: AccessMask) -> bool {
        (!access.read || self.read) && (!access.write || self.write) && (!access.delete || self.delete)
    }
}

/// What to do when the path does or does not exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Open an existing path; fail if missing.
    #[default]
    Open,
    /// Create a new path; fail if it exists.
    Create,
    /// Open if it exists, otherwise create.
    OpenIf,
    /// Open and truncate if it exists, otherwise create.
    OverwriteIf,
}

/// Parameters of an `on_create` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: AccessMask,
    pub share: AccessMask,
    pub disposition: CreateDisposition,
    /// Open or create a directory.
    pub directory: bool,
    /// Mark the handle `DeleteOnClose` as part of the open.
    pub delete_on_close: bool,
}

impl OpenOptions {
    /// Open an existing file for reading, sharing everything.
    pub fn read() -> Self {
        Self {
            access: AccessMask::READ,
            share: AccessMask::ALL,
            disposition: CreateDisposition::Open,
            directory: false,
            delete_on_close: false,
        }
    }

    /// Open an existing file for reading and writing.
    pub fn write() -> Self {
        Self {
            access: AccessMask::READ_WRITE,
            ..Self::read()
        }
    }

    /// Create a new file for writing.
    pub fn create_file() -> Self {
        Self {
            disposition: CreateDisposition::Create,
            ..Self::write()
        }
    }

    /// Open an existing directory for listing.
    pub fn dir() -> Self {
        Self {
            directory: true,
            ..Self::read()
        }
    }

    /// Create a new directory.
    pub fn create_dir() -> Self {
        Self {
            disposition: CreateDisposition::Create,
            ..Self::dir()
        }
    }

    /// Set the requested access.
    pub fn with_access(mut self, access: AccessMask) -> Self {
        self.access = access;
        self
    }

    /// Set the share mode.
    pub fn with_share(mut self, share: AccessMask) -> Self {
        self.share = share;
        self
    }

    /// Set the create disposition.
    pub fn with_disposition(mut self, disposition: CreateDisposition) -> Self {
        self.disposition = disposition;
        self
    }

    /// Request delete access and mark the handle `DeleteOnClose`.
    pub fn with_delete_on_close(mut self) -> Self {
        self.access = self.access.with_delete();
        self.delete_on_close = true;
        self
    }
}

/// How a handle asks for its target to be deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteDisposition {
    /// Reversible mark; the path is delete-pending for new opens at once.
    SetDisposition,
    /// Irreversible mark; invisible to other handles until this one closes.
    DeleteOnClose,
}

/// Progress of a handle's directory listing.
#[derive(Clone, Debug, Default)]
pub enum EnumerationSession {
    #[default]
    NotStarted,
    InProgress(ContinuationToken),
    Finished,
}

/// Per-handle state for one open file instance.
#[derive(Debug)]
pub struct OperationContext {
    pub id: HandleId,
    /// Current path; follows renames.
    pub path: VirtualPath,
    pub is_directory: bool,
    pub access: AccessMask,
    pub share: AccessMask,
    pub delete_mark: Option<DeleteDisposition>,
    pub enumeration: EnumerationSession,
    /// Cancels the handle's in-flight operation.
    pub cancel: CancellationToken,
    /// Content changed through this handle.
    pub modified: bool,
    /// Target moved outside the managed tree.
    pub detached: bool,
}

impl OperationContext {
    /// Path of a handle still attached to the tree.
    pub fn attached_path(&self) -> Result<VirtualPath, VfsError> {
        if self.detached {
            return Err(VfsError::PathNotFound(format!(
                "{} was moved out of the tree",
                self.path
            )));
        }
        Ok(self.path.clone())
    }
}

/// Shared reference to one handle's context.
pub type SharedContext = Arc<Mutex<OperationContext>>;

/// Table of open handles.
pub struct HandleTable {
    handles: DashMap<HandleId, SharedContext>,
    next_id: AtomicU64,
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new handle.
    ///
    /// # Arguments
    /// * `path` - Opened path
    /// * `is_directory` - Whether the path is a directory
    /// * `options` - Open parameters
    /// * `cancel` - Token for the handle's operations
    pub fn insert(
        &self,
        path: VirtualPath,
        is_directory: bool,
        options: &OpenOptions,
        cancel: CancellationToken,
    ) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = OperationContext {
            id,
            path,
            is_directory,
            access: options.access,
            share: options.share,
            delete_mark: options
                .delete_on_close
                .then_some(DeleteDisposition::DeleteOnClose),
            enumeration: EnumerationSession::NotStarted,
            cancel,
            modified: false,
            detached: false,
        };
        self.handles.insert(id, Arc::new(Mutex::new(context)));
        id
    }

    /// Look up a handle.
    pub fn get(&self, id: HandleId) -> Result<SharedContext, Status> {
        self.handles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Status::InvalidHandle)
    }

    /// Remove a handle.
    pub fn remove(&self, id: HandleId) -> Result<SharedContext, Status> {
        self.handles
            .remove(&id)
            .map(|(_, context)| context)
            .ok_or(Status::InvalidHandle)
    }

    /// Every handle, in id order.
    pub fn all(&self) -> Vec<SharedContext> {
        let mut entries: Vec<(HandleId, SharedContext)> = self
            .handles
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, context)| context).collect()
    }

    /// Handles open on `path` (attached ones only), excluding `except`.
    pub fn on_path(&self, path: &VirtualPath, except: Option<HandleId>) -> Vec<SharedContext> {
        self.all()
            .into_iter()
            .filter(|context| {
                let context = context.lock();
                !context.detached && context.path == *path && Some(context.id) != except
            })
            .collect()
    }

    /// Handles open on `dir` or anything beneath it.
    pub fn under(&self, dir: &VirtualPath) -> Vec<SharedContext> {
        self.all()
            .into_iter()
            .filter(|context| {
                let context = context.lock();
                !context.detached && context.path.starts_with(dir)
            })
            .collect()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no handle is open.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(path: &str) -> VirtualPath {
        VirtualPath::new(path).unwrap()
    }

    #[test]
    fn test_share_permits() {
        assert!(AccessMask::ALL.permits(AccessMask::READ_WRITE));
        assert!(AccessMask::READ.permits(AccessMask::READ));
        assert!(!AccessMask::READ.permits(AccessMask::READ_WRITE));
        assert!(!AccessMask::READ_WRITE.permits(AccessMask::NONE.with_delete()));
        assert!(AccessMask::NONE.permits(AccessMask::NONE));
    }

    #[test]
    fn test_open_options_builders() {
        let options = OpenOptions::read().with_delete_on_close();
        assert!(options.access.delete);
        assert!(options.delete_on_close);

        let dir = OpenOptions::create_dir();
        assert!(dir.directory);
        assert_eq!(dir.disposition, CreateDisposition::Create);
    }

    #[test]
    fn test_insert_lookup_remove() {
        let table = HandleTable::new();
        let a = table.insert(p("a.txt"), false, &OpenOptions::read(), CancellationToken::new());
        let b = table.insert(
            p("A.TXT"),
            false,
            &OpenOptions::read().with_delete_on_close(),
            CancellationToken::new(),
        );
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(b).unwrap().lock().delete_mark,
            Some(DeleteDisposition::DeleteOnClose)
        );

        assert_eq!(table.on_path(&p("a.txt"), None).len(), 2);
        assert_eq!(table.on_path(&p("a.txt"), Some(a)).len(), 1);

        table.remove(a).unwrap();
        assert_eq!(table.remove(a).unwrap_err(), Status::InvalidHandle);
        assert_eq!(table.get(a).unwrap_err(), Status::InvalidHandle);
    }

    #[test]
    fn test_under_and_detached() {
        let table = HandleTable::new();
        let a = table.insert(p("dir/a.txt"), false, &OpenOptions::read(), CancellationToken::new());
        table.insert(p("dir"), true, &OpenOptions::dir(), CancellationToken::new());
        table.insert(p("other"), true, &OpenOptions::dir(), CancellationToken::new());
        assert_eq!(table.under(&p("dir")).len(), 2);

        table.get(a).unwrap().lock().detached = true;
        assert_eq!(table.under(&p("dir")).len(), 1);
        assert!(table.get(a).unwrap().lock().attached_path().is_err());
    }
}
