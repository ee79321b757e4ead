//! Operation Dispatcher: the filter callback boundary.
//!
//! Every callback locks its target path(s) together with their parent
//! directories, reads the current state, applies the transition table, and
//! updates the state store, directory overlays and local content before the
//! locks are released. Failures are translated to a [`Status`] exactly once,
//! on the way out.
//!
//! # Delete timing
//!
//! A delete is a two-phase commit on the handle's [`OperationContext`]:
//! `on_delete` places a mark (reversible for `SetDisposition`), and the entry
//! is removed when the marking handle has closed and no other handle remains
//! open on the path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rusty_projection_vfs::{
    next_state, AsyncExecutor, BackingStore, CancellationToken, DirEntry, DirectoryOverlays,
    DiskLocalStore, EnumerationMerger, EnumerationPage, ListingSource, LocalStore, LockManager,
    Materializer, MemoryLocalStore, OverlayChild, PathEntry, PathGuard, PathState,
    PathStateStore, PersistentState, PlaceholderVersion, StateStore, Transition, VfsError,
    VirtualPath,
};

use crate::background::{BackgroundTask, BackgroundTaskRunner};
use crate::error::FilterError;
use crate::handles::{
    AccessMask, CreateDisposition, DeleteDisposition, EnumerationSession, HandleId, HandleTable,
    OpenOptions, SharedContext,
};
use crate::modified_paths::{ModificationSummary, ModifiedPathsDatabase};
use crate::options::FilterOptions;
use crate::stats::{Callback, FilterCounters, FilterStats, FilterStatsCollector};
use crate::status::Status;

/// Target of a rename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Path inside the managed tree.
    Inside(VirtualPath),
    /// Path outside the managed tree.
    Outside(PathBuf),
}

/// Result of `on_query_attributes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttributes {
    /// Case-preserving path.
    pub path: VirtualPath,
    pub is_directory: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
    pub state: PathState,
    /// Placeholder identity, for `Placeholder` and `Full` paths.
    pub version: Option<PlaceholderVersion>,
}

/// One page returned by `on_enumerate`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnumerationReply {
    pub entries: Vec<DirEntry>,
    /// No entries remain in this listing sequence.
    pub finished: bool,
}

/// Entry standing in for the virtualization root, which has no store entry.
fn root_entry() -> PathEntry {
    PathEntry::local(VirtualPath::root(), true)
}

/// Where a directory's listing comes from.
fn source_of(entry: &PathEntry) -> ListingSource {
    if entry.state == PathState::Local && !entry.path.is_root() {
        ListingSource::LocalOnly
    } else {
        ListingSource::Projected
    }
}

fn parent_of(path: &VirtualPath) -> Result<VirtualPath, VfsError> {
    path.parent()
        .ok_or_else(|| VfsError::InvalidPath("the root has no parent".to_string()))
}

fn slice_range(data: Vec<u8>, offset: u64, len: usize) -> Vec<u8> {
    let start: usize = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end: usize = start.saturating_add(len).min(data.len());
    data[start..end].to_vec()
}

/// Routes filter callbacks to the state machine.
pub struct Dispatcher {
    options: FilterOptions,
    /// Lowercase keys of delete-protected paths.
    protected: HashSet<String>,
    store: Arc<dyn StateStore>,
    overlays: Arc<DirectoryOverlays>,
    /// Journal-backed state, when a state directory is configured.
    persistent: Option<PersistentState>,
    local: Arc<dyn LocalStore>,
    executor: Arc<AsyncExecutor>,
    locks: Arc<LockManager>,
    materializer: Materializer,
    merger: EnumerationMerger,
    handles: HandleTable,
    /// Paths whose delete is committed but waits for other handles to close.
    doomed: DashMap<String, VirtualPath>,
    counters: Arc<FilterCounters>,
    modified_paths: Arc<ModifiedPathsDatabase>,
    background: BackgroundTaskRunner,
    collector: FilterStatsCollector,
}

impl Dispatcher {
    /// Create a dispatcher from options.
    ///
    /// State is journaled under `options.state_dir` and local content kept
    /// under `options.scratch_dir`; either falls back to memory when unset.
    ///
    /// # Arguments
    /// * `options` - Filter configuration
    /// * `backing` - Backing store client
    pub fn new(options: FilterOptions, backing: Arc<dyn BackingStore>) -> Result<Self, FilterError> {
        if !options.root_path.as_os_str().is_empty() && !options.root_path.is_dir() {
            return Err(FilterError::InvalidRootPath(options.root_path.clone()));
        }

        let persistent: Option<PersistentState> = match &options.state_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(PersistentState::open(dir)?)
            }
            None => None,
        };
        let store: Arc<dyn StateStore> = match &persistent {
            Some(state) => state.store.clone() as Arc<dyn StateStore>,
            None => Arc::new(PathStateStore::new()),
        };
        let overlays: Arc<DirectoryOverlays> = match &persistent {
            Some(state) => state.overlays.clone(),
            None => Arc::new(DirectoryOverlays::new()),
        };
        let local: Arc<dyn LocalStore> = match &options.scratch_dir {
            Some(dir) => Arc::new(DiskLocalStore::new(dir.clone())?),
            None => Arc::new(MemoryLocalStore::new()),
        };

        Self::build(options, backing, store, overlays, local, persistent)
    }

    /// Create a dispatcher over caller-supplied stores.
    ///
    /// # Arguments
    /// * `options` - Filter configuration (state and scratch dirs are ignored)
    /// * `backing` - Backing store client
    /// * `store` - Path-State Store
    /// * `overlays` - Directory overlays
    /// * `local` - Local content layer
    pub fn with_stores(
        options: FilterOptions,
        backing: Arc<dyn BackingStore>,
        store: Arc<dyn StateStore>,
        overlays: Arc<DirectoryOverlays>,
        local: Arc<dyn LocalStore>,
    ) -> Result<Self, FilterError> {
        Self::build(options, backing, store, overlays, local, None)
    }

    fn build(
        options: FilterOptions,
        backing: Arc<dyn BackingStore>,
        store: Arc<dyn StateStore>,
        overlays: Arc<DirectoryOverlays>,
        local: Arc<dyn LocalStore>,
        persistent: Option<PersistentState>,
    ) -> Result<Self, FilterError> {
        let executor = Arc::new(AsyncExecutor::new(options.executor_config())?);
        let locks = Arc::new(LockManager::new());
        let materializer = Materializer::new(
            store.clone(),
            local.clone(),
            backing.clone(),
            executor.clone(),
            locks.clone(),
            options.fetch_timeout,
        );
        let merger = EnumerationMerger::new(
            backing,
            executor.clone(),
            overlays.clone(),
            options.fetch_timeout,
        )
        .with_entry_header_size(options.entry_header_size);

        // Wire background task handler to update modified paths
        let modified_paths = Arc::new(ModifiedPathsDatabase::new());
        let paths_clone: Arc<ModifiedPathsDatabase> = modified_paths.clone();
        let background = BackgroundTaskRunner::new(move |task: BackgroundTask| match task {
            BackgroundTask::FileCreated(path) => {
                tracing::debug!("Background: file created {}", path);
                paths_clone.file_created(&path);
            }
            BackgroundTask::FileModified(path) => {
                tracing::debug!("Background: file modified {}", path);
                paths_clone.file_modified(&path);
            }
            BackgroundTask::FileDeleted(path) => {
                tracing::debug!("Background: file deleted {}", path);
                paths_clone.file_deleted(&path);
            }
            BackgroundTask::FileRenamed { old_path, new_path } => {
                tracing::debug!("Background: file renamed {} -> {}", old_path, new_path);
                paths_clone.file_renamed(&old_path, &new_path);
            }
            BackgroundTask::FolderCreated(path) => {
                tracing::debug!("Background: folder created {}", path);
                paths_clone.dir_created(&path);
            }
            BackgroundTask::FolderDeleted(path) => {
                tracing::debug!("Background: folder deleted {}", path);
                paths_clone.dir_deleted(&path);
            }
            BackgroundTask::FolderRenamed { old_path, new_path } => {
                tracing::debug!("Background: folder renamed {} -> {}", old_path, new_path);
                paths_clone.dir_renamed(&old_path, &new_path);
            }
        })?;

        let counters = Arc::new(FilterCounters::new());
        let collector =
            FilterStatsCollector::new(counters.clone(), modified_paths.clone(), Instant::now());
        let protected: HashSet<String> = options
            .protected_paths
            .iter()
            .filter_map(|p| VirtualPath::new(p).ok())
            .map(|p| p.key().to_string())
            .collect();

        tracing::info!(
            "Dispatcher ready for {} ({} entries, {} overlays)",
            options.root_path.display(),
            store.len(),
            overlays.len()
        );

        Ok(Self {
            options,
            protected,
            store,
            overlays,
            persistent,
            local,
            executor,
            locks,
            materializer,
            merger,
            handles: HandleTable::new(),
            doomed: DashMap::new(),
            counters,
            modified_paths,
            background,
            collector,
        })
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Open or create a path.
    ///
    /// Opening a `Virtual` file writes its placeholder; opening with write
    /// access materializes it.
    ///
    /// # Arguments
    /// * `path` - Target path
    /// * `options` - Access, share mode and disposition
    ///
    /// # Returns
    /// Handle for later callbacks.
    pub fn on_create(&self, path: &VirtualPath, options: OpenOptions) -> Result<HandleId, Status> {
        self.counters.callback(Callback::Create);
        tracing::debug!("on_create {} {:?}", path, options);
        let cancel: CancellationToken = self.executor.operation_token();
        let result = self.retrying(|| self.open(path, &options, &cancel));
        self.finish("create", path, result)
    }

    /// Read from an open file, materializing a placeholder first.
    ///
    /// # Arguments
    /// * `handle` - Open handle
    /// * `offset` - Byte offset
    /// * `len` - Maximum bytes to return
    pub fn on_read(&self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>, Status> {
        self.counters.callback(Callback::Read);
        let context: SharedContext = self.lookup(handle)?;
        let result = self.retrying(|| self.read(&context, offset, len));
        self.finish_handle("read", handle, result)
    }

    /// Write to an open file, materializing a placeholder first.
    ///
    /// # Returns
    /// Bytes written.
    pub fn on_write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize, Status> {
        self.counters.callback(Callback::Write);
        let context: SharedContext = self.lookup(handle)?;
        let result = self.retrying(|| self.write(&context, offset, data));
        self.finish_handle("write", handle, result)
    }

    /// Mark a handle's target for deletion.
    ///
    /// The entry stays in place until the marking handle closes.
    ///
    /// # Arguments
    /// * `handle` - Handle opened with delete access
    /// * `disposition` - `SetDisposition` (reversible) or `DeleteOnClose`
    pub fn on_delete(&self, handle: HandleId, disposition: DeleteDisposition) -> Result<(), Status> {
        self.counters.callback(Callback::Delete);
        let context: SharedContext = self.lookup(handle)?;
        let result = self.retrying(|| self.mark_delete(&context, disposition));
        self.finish_handle("delete", handle, result)
    }

    /// Clear a `SetDisposition` mark.
    ///
    /// A `DeleteOnClose` mark cannot be rescinded.
    pub fn on_undelete(&self, handle: HandleId) -> Result<(), Status> {
        self.counters.callback(Callback::Delete);
        let context: SharedContext = self.lookup(handle)?;
        let mut ctx = context.lock();
        if ctx.delete_mark == Some(DeleteDisposition::DeleteOnClose) {
            drop(ctx);
            self.counters.failure();
            tracing::debug!("undelete on {} -> delete-on-close is irreversible", handle);
            return Err(Status::AccessDenied);
        }
        ctx.delete_mark = None;
        tracing::debug!("Cleared delete mark on {} ({})", ctx.path, handle);
        Ok(())
    }

    /// Rename a handle's target.
    ///
    /// # Arguments
    /// * `handle` - Handle opened with delete access
    /// * `destination` - New location, inside or outside the tree
    /// * `replace_existing` - Replace an existing destination file
    pub fn on_rename(
        &self,
        handle: HandleId,
        destination: &Destination,
        replace_existing: bool,
    ) -> Result<(), Status> {
        self.counters.callback(Callback::Rename);
        let context: SharedContext = self.lookup(handle)?;
        let result = self.retrying(|| match destination {
            Destination::Inside(to) => self.rename_inside(&context, to, replace_existing),
            Destination::Outside(dest) => self.move_outside(&context, dest, replace_existing),
        });
        self.finish_handle("rename", handle, result)
    }

    /// Move a file or directory from outside the tree to `to`.
    ///
    /// The imported paths become `Local` and the outside copy is removed.
    ///
    /// # Arguments
    /// * `source` - Outside path
    /// * `to` - Destination inside the tree
    /// * `replace_existing` - Replace an existing destination file
    pub fn on_import(
        &self,
        source: &Path,
        to: &VirtualPath,
        replace_existing: bool,
    ) -> Result<(), Status> {
        self.counters.callback(Callback::Import);
        let result = self.retrying(|| self.import(source, to, replace_existing));
        self.finish("import", to, result)
    }

    /// Stat a path without opening it.
    pub fn on_query_attributes(&self, path: &VirtualPath) -> Result<FileAttributes, Status> {
        self.counters.callback(Callback::QueryAttributes);
        let result = self.retrying(|| self.query(path));
        self.finish("query attributes", path, result)
    }

    /// Produce the next page of a directory listing.
    ///
    /// The search expression is captured on the first call of a sequence
    /// and ignored afterwards until `restart`.
    ///
    /// # Arguments
    /// * `handle` - Directory handle
    /// * `restart` - Start a new sequence from the first entry
    /// * `max_bytes` - Page capacity
    /// * `filter` - Optional search expression
    pub fn on_enumerate(
        &self,
        handle: HandleId,
        restart: bool,
        max_bytes: usize,
        filter: Option<&str>,
    ) -> Result<EnumerationReply, Status> {
        self.counters.callback(Callback::Enumerate);
        let context: SharedContext = self.lookup(handle)?;
        let result = self.retrying(|| self.enumerate(&context, restart, max_bytes, filter));
        self.finish_handle("enumerate", handle, result)
    }

    /// Close a handle, committing any pending delete.
    pub fn on_close(&self, handle: HandleId) -> Result<(), Status> {
        self.counters.callback(Callback::Close);
        let context: SharedContext = match self.handles.remove(handle) {
            Ok(context) => context,
            Err(status) => {
                self.counters.failure();
                return Err(status);
            }
        };
        let result = self.retrying(|| self.close(&context));
        self.finish_handle("close", handle, result)
    }

    /// Cancel the in-flight operation on a handle.
    ///
    /// A cancelled materialization leaves the path in `Placeholder`.
    pub fn on_cancel(&self, handle: HandleId) -> Result<(), Status> {
        self.counters.callback(Callback::Cancel);
        let context: SharedContext = self.lookup(handle)?;
        let previous: CancellationToken = {
            let mut ctx = context.lock();
            std::mem::replace(&mut ctx.cancel, self.executor.operation_token())
        };
        previous.cancel();
        tracing::debug!("Cancelled operation on {}", handle);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Path-State Store backing this dispatcher.
    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Directory overlays.
    pub fn overlays(&self) -> &Arc<DirectoryOverlays> {
        &self.overlays
    }

    /// Local content layer.
    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Drop cached backing listings after the backing store moved epochs.
    pub fn invalidate_listings(&self) {
        self.merger.invalidate_all();
    }

    /// Block until queued change notifications have been recorded.
    ///
    /// # Returns
    /// False if `timeout` elapsed first.
    pub fn wait_for_notifications(&self, timeout: Duration) -> bool {
        self.background.wait_idle(timeout)
    }

    /// Paths changed since the dispatcher started.
    pub fn modification_summary(&self) -> ModificationSummary {
        self.modified_paths.get_summary()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> FilterStats {
        self.collector
            .collect(self.materializer.fetch_count(), self.handles.len())
    }

    /// Rewrite the state journal from the live state.
    ///
    /// A no-op when state is held in memory.
    pub fn compact(&self) -> Result<(), FilterError> {
        if let Some(state) = &self.persistent {
            state.compact()?;
            tracing::info!("Compacted state journal");
        }
        Ok(())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn lookup(&self, handle: HandleId) -> Result<SharedContext, Status> {
        self.handles.get(handle).map_err(|status| {
            self.counters.failure();
            tracing::debug!("Unknown handle {}", handle);
            status
        })
    }

    /// Run `op`, retrying lost compare-and-set races a bounded number of times.
    fn retrying<T>(&self, op: impl Fn() -> Result<T, VfsError>) -> Result<T, VfsError> {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Err(VfsError::LostRace(detail)) if attempt < self.options.lost_race_retries => {
                    attempt += 1;
                    self.counters.lost_race_retry();
                    tracing::debug!(
                        "Lost race ({}), retry {}/{}",
                        detail,
                        attempt,
                        self.options.lost_race_retries
                    );
                }
                other => return other,
            }
        }
    }

    fn finish<T>(
        &self,
        operation: &str,
        path: &VirtualPath,
        result: Result<T, VfsError>,
    ) -> Result<T, Status> {
        result.map_err(|e| self.fail(operation, &path.to_string(), &e))
    }

    fn finish_handle<T>(
        &self,
        operation: &str,
        handle: HandleId,
        result: Result<T, VfsError>,
    ) -> Result<T, Status> {
        result.map_err(|e| self.fail(operation, &handle.to_string(), &e))
    }

    fn fail(&self, operation: &str, target: &str, e: &VfsError) -> Status {
        self.counters.failure();
        let status: Status = Status::from(e);
        if e.is_corruption() {
            tracing::error!("{} on {}: {} (path is inaccessible)", operation, target, e);
        } else if matches!(status, Status::IoDevice | Status::InternalError) {
            tracing::warn!("{} on {} failed: {}", operation, target, e);
        } else {
            tracing::debug!("{} on {} -> {}: {}", operation, target, status, e);
        }
        status
    }

    fn notify(&self, task: BackgroundTask) {
        let mask = &self.options.notifications;
        let wanted: bool = match &task {
            BackgroundTask::FileCreated(_) | BackgroundTask::FolderCreated(_) => {
                mask.new_file_created
            }
            BackgroundTask::FileModified(_) => mask.file_modified,
            BackgroundTask::FileDeleted(_) | BackgroundTask::FolderDeleted(_) => mask.file_deleted,
            BackgroundTask::FileRenamed { .. } | BackgroundTask::FolderRenamed { .. } => {
                mask.file_renamed
            }
        };
        if wanted {
            self.background.enqueue(task);
        }
    }

    /// Lock a handle's current path, failing with `LostRace` if a rename
    /// moved it before the lock was taken.
    fn lock_handle(&self, context: &SharedContext) -> Result<(VirtualPath, PathGuard), VfsError> {
        let path: VirtualPath = context.lock().attached_path()?;
        let guard: PathGuard = self.locks.lock_path(&path);
        if context.lock().attached_path()? != path {
            return Err(VfsError::LostRace(format!("{} moved while locking", path)));
        }
        Ok((path, guard))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Entry for a path, discovering it from its parent's listing if needed.
    ///
    /// # Returns
    /// None if neither the store nor the merged listing has the path;
    /// `PathNotFound` if an intermediate directory is missing.
    fn resolve(&self, path: &VirtualPath) -> Result<Option<PathEntry>, VfsError> {
        if path.is_root() {
            return Ok(Some(root_entry()));
        }
        if let Some(entry) = self.store.get(path) {
            return Ok(Some(entry));
        }

        let parent: PathEntry = self.require_parent(path)?;
        let listed: Option<DirEntry> =
            self.merger
                .find_child(&parent.path, path.name(), source_of(&parent))?;
        match listed {
            Some(child) if child.version.is_some() => {
                let found: VirtualPath = parent.path.join(&child.name);
                self.discover(&found, child.is_directory).map(Some)
            }
            Some(child) => {
                tracing::warn!("Overlay lists {} under {} without an entry", child.name, parent.path);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Parent directory entry of `path`, which must exist.
    fn require_parent(&self, path: &VirtualPath) -> Result<PathEntry, VfsError> {
        let parent: VirtualPath = parent_of(path)?;
        match self.resolve(&parent)? {
            Some(entry) if entry.is_directory => Ok(entry),
            Some(_) => Err(VfsError::NotADirectory(parent.to_string())),
            None => Err(VfsError::PathNotFound(parent.to_string())),
        }
    }

    /// Record a backing-store path as `Virtual`.
    fn discover(&self, path: &VirtualPath, is_directory: bool) -> Result<PathEntry, VfsError> {
        next_state(PathState::None, Transition::Discover, is_directory)?;
        let entry: PathEntry = PathEntry::virtual_entry(path.clone(), is_directory);
        if self
            .store
            .compare_and_set(path, PathState::None, Some(entry.clone()))?
        {
            tracing::debug!("Discovered {}", path);
            return Ok(entry);
        }
        self.store
            .get(path)
            .ok_or_else(|| VfsError::LostRace(format!("{} vanished during discovery", path)))
    }

    /// Listing entry for a path in its parent directory.
    fn listed(&self, path: &VirtualPath) -> Result<Option<DirEntry>, VfsError> {
        let parent: PathEntry = self.require_parent(path)?;
        self.merger
            .find_child(&parent.path, path.name(), source_of(&parent))
    }

    /// Size as reported to callers.
    fn entry_size(&self, entry: &PathEntry) -> Result<u64, VfsError> {
        if entry.is_directory {
            return Ok(0);
        }
        match entry.state {
            PathState::Full | PathState::Local => Ok(self.local.size(&entry.path)?.unwrap_or(0)),
            _ => Ok(self.listed(&entry.path)?.map(|c| c.size).unwrap_or(0)),
        }
    }

    fn has_children(&self, dir: &PathEntry) -> Result<bool, VfsError> {
        self.merger.has_children(&dir.path, source_of(dir))
    }

    fn is_protected(&self, path: &VirtualPath) -> bool {
        self.protected.contains(path.key())
    }

    fn check_not_delete_pending(&self, path: &VirtualPath) -> Result<(), VfsError> {
        let pending: bool = self.doomed.contains_key(path.key())
            || self
                .handles
                .on_path(path, None)
                .iter()
                .any(|c| c.lock().delete_mark == Some(DeleteDisposition::SetDisposition));
        if pending {
            return Err(VfsError::DeletePending(path.to_string()));
        }
        Ok(())
    }

    fn check_sharing(
        &self,
        path: &VirtualPath,
        access: AccessMask,
        share: AccessMask,
        except: Option<HandleId>,
    ) -> Result<(), VfsError> {
        for context in self.handles.on_path(path, except) {
            let other = context.lock();
            if !other.share.permits(access) || !share.permits(other.access) {
                return Err(VfsError::AccessDenied(format!(
                    "sharing violation on {} with handle {}",
                    path, other.id
                )));
            }
        }
        Ok(())
    }

    /// Check that `entry` may be marked for deletion.
    fn check_deletable(&self, entry: &PathEntry, except: Option<HandleId>) -> Result<(), VfsError> {
        if entry.path.is_root() {
            return Err(VfsError::AccessDenied("the root cannot be deleted".to_string()));
        }
        if self.is_protected(&entry.path) {
            return Err(VfsError::AccessDenied(format!("{} is protected", entry.path)));
        }
        next_state(entry.state, Transition::Delete, entry.is_directory)?;
        if entry.is_directory && self.has_children(entry)? {
            return Err(VfsError::DirectoryNotEmpty(entry.path.to_string()));
        }
        self.check_sharing(&entry.path, AccessMask::NONE.with_delete(), AccessMask::ALL, except)
    }

    /// Check that nothing is open beneath a directory about to move.
    fn check_no_open_children(&self, dir: &VirtualPath) -> Result<(), VfsError> {
        let open_below: bool = self
            .handles
            .under(dir)
            .iter()
            .any(|c| c.lock().path != *dir);
        if open_below {
            return Err(VfsError::AccessDenied(format!(
                "{} has open handles beneath it",
                dir
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Write placeholder metadata for a `Virtual` entry.
    fn promote(&self, entry: PathEntry) -> Result<PathEntry, VfsError> {
        let target: PathState =
            next_state(entry.state, Transition::CreatePlaceholder, entry.is_directory)?;
        let version: PlaceholderVersion = match self.listed(&entry.path)?.and_then(|c| c.version) {
            Some(version) => version,
            None if entry.is_directory => return Ok(entry),
            None => return Err(VfsError::PathNotFound(entry.path.to_string())),
        };

        let placeholder: PathEntry =
            PathEntry::placeholder(entry.path.clone(), entry.is_directory, &version);
        debug_assert_eq!(placeholder.state, target);
        if !self
            .store
            .compare_and_set(&entry.path, PathState::Virtual, Some(placeholder.clone()))?
        {
            return Err(VfsError::LostRace(entry.path.to_string()));
        }
        tracing::debug!("Created placeholder {} at epoch {}", entry.path, version.epoch);
        Ok(placeholder)
    }

    /// Promote on open; an empty `Virtual` directory is left collapsed.
    fn ensure_placeholder(&self, entry: PathEntry) -> Result<PathEntry, VfsError> {
        if entry.state != PathState::Virtual || entry.path.is_root() {
            return Ok(entry);
        }
        if entry.is_directory && !self.has_children(&entry)? {
            tracing::debug!("Collapsed empty directory {}", entry.path);
            return Ok(entry);
        }
        self.promote(entry)
    }

    /// Materialize a placeholder, refreshing its metadata once if stale.
    fn hydrate(
        &self,
        path: &VirtualPath,
        guard: &PathGuard,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, VfsError> {
        let data: Vec<u8> = match self.materializer.materialize_locked(path, guard, token) {
            Err(VfsError::StaleEpoch {
                recorded, current, ..
            }) => {
                tracing::info!(
                    "Refreshing stale placeholder {} (epoch {} -> {})",
                    path,
                    recorded,
                    current
                );
                self.refresh_placeholder(path)?;
                self.counters.stale_refresh();
                self.materializer.materialize_locked(path, guard, token)?
            }
            other => other?,
        };
        self.counters.materialization();
        Ok(data)
    }

    fn refresh_placeholder(&self, path: &VirtualPath) -> Result<(), VfsError> {
        let entry: PathEntry = self
            .store
            .get(path)
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        next_state(entry.state, Transition::Refresh, entry.is_directory)?;

        let parent: VirtualPath = parent_of(path)?;
        let current = self
            .merger
            .refresh_child(&parent, path.name())?
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        let refreshed: PathEntry =
            PathEntry::placeholder(entry.path.clone(), entry.is_directory, &current.version());
        if !self
            .store
            .compare_and_set(path, entry.state, Some(refreshed))?
        {
            return Err(VfsError::LostRace(path.to_string()));
        }
        Ok(())
    }

    /// Truncate a file to zero bytes, promoting a placeholder without a fetch.
    fn overwrite(&self, entry: &PathEntry) -> Result<(), VfsError> {
        match entry.state {
            PathState::Placeholder => {
                let target: PathState =
                    next_state(entry.state, Transition::Materialize, entry.is_directory)?;
                self.local.write_all(&entry.path, &[])?;
                if !self.store.compare_and_set(
                    &entry.path,
                    PathState::Placeholder,
                    Some(entry.with_state(target)),
                )? {
                    self.local.remove(&entry.path)?;
                    return Err(VfsError::LostRace(entry.path.to_string()));
                }
                Ok(())
            }
            PathState::Full | PathState::Local => self.local.truncate(&entry.path, 0),
            state => Err(VfsError::AccessDenied(format!(
                "cannot overwrite {} in {:?}",
                entry.path, state
            ))),
        }
    }

    /// Create a `Local` entry with initial content.
    fn insert_local(
        &self,
        path: &VirtualPath,
        is_directory: bool,
        data: &[u8],
    ) -> Result<PathEntry, VfsError> {
        let parent: VirtualPath = parent_of(path)?;
        next_state(PathState::None, Transition::CreateLocal, is_directory)?;
        let entry: PathEntry = PathEntry::local(path.clone(), is_directory);
        if !self
            .store
            .compare_and_set(path, PathState::None, Some(entry.clone()))?
        {
            return Err(VfsError::LostRace(path.to_string()));
        }
        if !is_directory {
            self.local.write_all(path, data)?;
        }
        self.overlays
            .record_created(&parent, path.name(), is_directory, data.len() as u64)?;
        Ok(entry)
    }

    /// Remove an entry whose delete has been committed.
    fn finalize_delete(&self, path: &VirtualPath) -> Result<(), VfsError> {
        let Some(entry) = self.store.get(path) else {
            return Ok(());
        };
        next_state(entry.state, Transition::Delete, entry.is_directory)?;
        if entry.is_directory && self.has_children(&entry)? {
            return Err(VfsError::DirectoryNotEmpty(path.to_string()));
        }
        if !self.store.compare_and_set(path, entry.state, None)? {
            return Err(VfsError::LostRace(path.to_string()));
        }

        self.local.remove(path)?;
        if entry.is_directory {
            self.overlays.forget_subtree(path)?;
        }
        self.overlays.record_deleted(&parent_of(path)?, path.name())?;

        tracing::debug!("Deleted {} (was {:?})", entry.path, entry.state);
        self.notify(if entry.is_directory {
            BackgroundTask::FolderDeleted(entry.path.to_string())
        } else {
            BackgroundTask::FileDeleted(entry.path.to_string())
        });
        Ok(())
    }

    /// Pin a projected directory's listing, recursively, so it survives a
    /// move away from the path the backing store knows it by.
    fn expand_subtree(&self, dir: &PathEntry) -> Result<(), VfsError> {
        if source_of(dir) == ListingSource::LocalOnly
            || self.overlays.get(&dir.path).is_some_and(|o| o.is_expanded())
        {
            return Ok(());
        }

        let children: Vec<DirEntry> = self.merger.merged(&dir.path, ListingSource::Projected)?;
        for child in &children {
            let child_path: VirtualPath = dir.path.join(&child.name);
            let entry: PathEntry = match self.store.get(&child_path) {
                Some(entry) => entry,
                None if child.version.is_some() => {
                    self.discover(&child_path, child.is_directory)?
                }
                None => continue,
            };
            let entry: PathEntry = if entry.state == PathState::Virtual {
                self.promote(entry)?
            } else {
                entry
            };
            if entry.is_directory {
                self.expand_subtree(&entry)?;
            }
        }

        self.overlays.expand(
            &dir.path,
            children
                .into_iter()
                .map(|c| OverlayChild {
                    name: c.name,
                    is_directory: c.is_directory,
                    size: c.size,
                })
                .collect(),
        )?;
        tracing::debug!("Expanded {}", dir.path);
        Ok(())
    }

    // ========================================================================
    // Operation bodies
    // ========================================================================

    fn open(
        &self,
        path: &VirtualPath,
        options: &OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<HandleId, VfsError> {
        if options.delete_on_close && !options.access.delete {
            return Err(VfsError::AccessDenied(
                "delete-on-close requires delete access".to_string(),
            ));
        }

        let guard: PathGuard = self.locks.lock_path(path);
        let existing: Option<PathEntry> = self.resolve(path)?;

        let Some(entry) = existing else {
            if options.disposition == CreateDisposition::Open {
                return Err(VfsError::PathNotFound(path.to_string()));
            }
            let entry: PathEntry = self.insert_local(path, options.directory, &[])?;
            tracing::debug!("Created local {}", path);
            self.notify(if options.directory {
                BackgroundTask::FolderCreated(path.to_string())
            } else {
                BackgroundTask::FileCreated(path.to_string())
            });
            return Ok(self
                .handles
                .insert(entry.path, options.directory, options, cancel.clone()));
        };

        if options.disposition == CreateDisposition::Create {
            return Err(VfsError::DestinationExists(path.to_string()));
        }
        self.check_not_delete_pending(path)?;
        if options.directory && !entry.is_directory {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        let truncate: bool = options.disposition == CreateDisposition::OverwriteIf;
        if entry.is_directory && (options.access.write || truncate) {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        self.check_sharing(path, options.access, options.share, None)?;
        if options.delete_on_close {
            self.check_deletable(&entry, None)?;
        }
        entry.version()?;

        let entry: PathEntry = self.ensure_placeholder(entry)?;
        if !entry.is_directory {
            if truncate {
                self.overwrite(&entry)?;
            } else if options.access.write && entry.state == PathState::Placeholder {
                self.hydrate(path, &guard, cancel)?;
            }
        }

        let id: HandleId =
            self.handles
                .insert(entry.path.clone(), entry.is_directory, options, cancel.clone());
        if truncate {
            if let Ok(context) = self.handles.get(id) {
                context.lock().modified = true;
            }
        }
        tracing::debug!("Opened {} as {} ({:?})", entry.path, id, entry.state);
        Ok(id)
    }

    fn read(&self, context: &SharedContext, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let (access, token): (AccessMask, CancellationToken) = {
            let ctx = context.lock();
            (ctx.access, ctx.cancel.clone())
        };
        if !access.read {
            return Err(VfsError::AccessDenied("handle lacks read access".to_string()));
        }

        let (path, guard) = self.lock_handle(context)?;
        let entry: PathEntry = self
            .store
            .get(&path)
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        if entry.is_directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }

        match entry.state {
            PathState::Placeholder => Ok(slice_range(self.hydrate(&path, &guard, &token)?, offset, len)),
            PathState::Full | PathState::Local => self.local.read(&path, offset, len),
            state => Err(VfsError::AccessDenied(format!(
                "{} cannot be read in {:?}",
                path, state
            ))),
        }
    }

    fn write(&self, context: &SharedContext, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        let (access, token): (AccessMask, CancellationToken) = {
            let ctx = context.lock();
            (ctx.access, ctx.cancel.clone())
        };
        if !access.write {
            return Err(VfsError::AccessDenied("handle lacks write access".to_string()));
        }

        let (path, guard) = self.lock_handle(context)?;
        let entry: PathEntry = self
            .store
            .get(&path)
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        if entry.is_directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }

        match entry.state {
            PathState::Placeholder => {
                self.hydrate(&path, &guard, &token)?;
            }
            PathState::Full | PathState::Local => {}
            state => {
                return Err(VfsError::AccessDenied(format!(
                    "{} cannot be written in {:?}",
                    path, state
                )))
            }
        }

        let written: usize = self.local.write_at(&path, offset, data)?;
        context.lock().modified = true;
        Ok(written)
    }

    fn mark_delete(
        &self,
        context: &SharedContext,
        disposition: DeleteDisposition,
    ) -> Result<(), VfsError> {
        let (id, access): (HandleId, AccessMask) = {
            let ctx = context.lock();
            (ctx.id, ctx.access)
        };
        if !access.delete {
            return Err(VfsError::AccessDenied("handle lacks delete access".to_string()));
        }

        let (path, _guard) = self.lock_handle(context)?;
        let entry: PathEntry = self
            .resolve(&path)?
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        self.check_deletable(&entry, Some(id))?;

        let mut ctx = context.lock();
        ctx.delete_mark = match ctx.delete_mark {
            Some(DeleteDisposition::DeleteOnClose) => Some(DeleteDisposition::DeleteOnClose),
            _ => Some(disposition),
        };
        tracing::debug!("Marked {} for deletion ({:?})", path, ctx.delete_mark);
        Ok(())
    }

    fn close(&self, context: &SharedContext) -> Result<(), VfsError> {
        let (detached, modified, mark, is_directory) = {
            let ctx = context.lock();
            (ctx.detached, ctx.modified, ctx.delete_mark, ctx.is_directory)
        };
        if detached {
            return Ok(());
        }

        let (path, _guard) = self.lock_handle(context)?;
        if modified && !is_directory {
            if let Some(entry) = self.store.get(&path) {
                if entry.state == PathState::Local {
                    let size: u64 = self.local.size(&path)?.unwrap_or(0);
                    self.overlays
                        .record_created(&parent_of(&path)?, path.name(), false, size)?;
                }
                self.notify(BackgroundTask::FileModified(entry.path.to_string()));
            }
        }

        if mark.is_none() && !self.doomed.contains_key(path.key()) {
            return Ok(());
        }
        if self.handles.on_path(&path, None).is_empty() {
            self.doomed.remove(path.key());
            self.finalize_delete(&path)
        } else {
            tracing::debug!("Delete of {} deferred until other handles close", path);
            self.doomed.insert(path.key().to_string(), path);
            Ok(())
        }
    }

    fn rename_inside(
        &self,
        context: &SharedContext,
        to: &VirtualPath,
        replace_existing: bool,
    ) -> Result<(), VfsError> {
        let (id, access, from): (HandleId, AccessMask, VirtualPath) = {
            let ctx = context.lock();
            (ctx.id, ctx.access, ctx.attached_path()?)
        };
        if !access.delete {
            return Err(VfsError::AccessDenied("rename requires delete access".to_string()));
        }
        if from.is_root() || to.is_root() {
            return Err(VfsError::InvalidPath("the root cannot be renamed".to_string()));
        }

        let _guard: PathGuard = self.locks.lock_pair(&from, to);
        if context.lock().attached_path()? != from {
            return Err(VfsError::LostRace(format!("{} moved while locking", from)));
        }

        let source: PathEntry = self
            .resolve(&from)?
            .ok_or_else(|| VfsError::PathNotFound(from.to_string()))?;
        next_state(source.state, Transition::Rename, source.is_directory)?;
        if self.doomed.contains_key(from.key()) {
            return Err(VfsError::DeletePending(from.to_string()));
        }
        if source.is_directory && to.starts_with(&from) && *to != from {
            return Err(VfsError::InvalidPath(format!("cannot move {} beneath itself", from)));
        }
        self.require_parent(to)?;

        let same_path: bool = *to == from;
        if !same_path {
            if let Some(existing) = self.resolve(to)? {
                if !replace_existing {
                    return Err(VfsError::DestinationExists(to.to_string()));
                }
                if existing.is_directory || self.is_protected(to) {
                    return Err(VfsError::AccessDenied(format!("cannot replace {}", to)));
                }
                if !self.handles.on_path(to, None).is_empty() {
                    return Err(VfsError::AccessDenied(format!("{} is open", to)));
                }
            }
        }
        self.check_sharing(&from, AccessMask::NONE.with_delete(), AccessMask::ALL, Some(id))?;

        let source: PathEntry = if source.state == PathState::Virtual {
            self.promote(source)?
        } else {
            source
        };
        if source.is_directory {
            self.check_no_open_children(&from)?;
            self.expand_subtree(&source)?;
        }
        let size: u64 = self.entry_size(&source)?;

        if !same_path && self.store.get(to).is_some() {
            self.local.remove(to)?;
        }
        self.store.rename(&from, to, replace_existing)?;
        if from.key() != to.key() {
            self.local.rename(&from, to)?;
        }
        if source.is_directory {
            self.overlays.move_subtree(&from, to)?;
        }
        self.overlays.record_deleted(&parent_of(&from)?, from.name())?;
        self.overlays
            .record_created(&parent_of(to)?, to.name(), source.is_directory, size)?;

        for handle in self.handles.under(&from) {
            let mut ctx = handle.lock();
            if let Some(moved) = ctx.path.rebase(&from, to) {
                ctx.path = moved;
            }
        }

        tracing::debug!("Renamed {} -> {} ({:?})", from, to, source.state);
        self.notify(if source.is_directory {
            BackgroundTask::FolderRenamed {
                old_path: from.to_string(),
                new_path: to.to_string(),
            }
        } else {
            BackgroundTask::FileRenamed {
                old_path: from.to_string(),
                new_path: to.to_string(),
            }
        });
        Ok(())
    }

    fn move_outside(
        &self,
        context: &SharedContext,
        dest: &Path,
        replace_existing: bool,
    ) -> Result<(), VfsError> {
        let (id, access, token): (HandleId, AccessMask, CancellationToken) = {
            let ctx = context.lock();
            (ctx.id, ctx.access, ctx.cancel.clone())
        };
        if !access.delete {
            return Err(VfsError::AccessDenied("rename requires delete access".to_string()));
        }

        let (from, guard) = self.lock_handle(context)?;
        if from.is_root() {
            return Err(VfsError::InvalidPath("the root cannot be moved".to_string()));
        }
        let source: PathEntry = self
            .resolve(&from)?
            .ok_or_else(|| VfsError::PathNotFound(from.to_string()))?;
        if self.doomed.contains_key(from.key()) {
            return Err(VfsError::DeletePending(from.to_string()));
        }
        if self.is_protected(&from) {
            return Err(VfsError::AccessDenied(format!("{} is protected", from)));
        }
        self.check_sharing(&from, AccessMask::NONE.with_delete(), AccessMask::ALL, Some(id))?;
        if source.is_directory {
            self.check_no_open_children(&from)?;
        }

        match dest.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            _ => return Err(VfsError::PathNotFound(dest.display().to_string())),
        }
        if dest.exists() {
            if !replace_existing {
                return Err(VfsError::DestinationExists(dest.display().to_string()));
            }
            if dest.is_dir() || source.is_directory {
                return Err(VfsError::AccessDenied(format!(
                    "cannot replace {}",
                    dest.display()
                )));
            }
        }

        self.export_subtree(source.clone(), dest, &guard, &token)?;
        self.remove_subtree(&source)?;
        self.overlays.record_deleted(&parent_of(&from)?, from.name())?;

        for handle in self.handles.under(&from) {
            handle.lock().detached = true;
        }

        tracing::debug!("Moved {} out of the tree to {}", from, dest.display());
        self.notify(if source.is_directory {
            BackgroundTask::FolderDeleted(source.path.to_string())
        } else {
            BackgroundTask::FileDeleted(source.path.to_string())
        });
        Ok(())
    }

    /// Write a path's full content (or tree) to an outside location.
    ///
    /// `guard` covers `entry.path`; descendants are locked one at a time
    /// beneath it while they are materialized.
    fn export_subtree(
        &self,
        entry: PathEntry,
        dest: &Path,
        guard: &PathGuard,
        token: &CancellationToken,
    ) -> Result<(), VfsError> {
        if entry.is_directory {
            std::fs::create_dir(dest)?;
            for child in self.merger.merged(&entry.path, source_of(&entry))? {
                let child_path: VirtualPath = entry.path.join(&child.name);
                let child_entry: PathEntry = self
                    .resolve(&child_path)?
                    .ok_or_else(|| VfsError::PathNotFound(child_path.to_string()))?;
                self.export_subtree(child_entry, &dest.join(&child.name), guard, token)?;
            }
            return Ok(());
        }

        let entry: PathEntry = if entry.state == PathState::Virtual {
            self.promote(entry)?
        } else {
            entry
        };
        if entry.state == PathState::Placeholder {
            if guard.covers(&entry.path) {
                self.hydrate(&entry.path, guard, token)?;
            } else {
                let inner: PathGuard = self.locks.lock_beneath(guard, &entry.path);
                self.hydrate(&entry.path, &inner, token)?;
            }
        }
        self.local.export(&entry.path, dest)
    }

    /// Drop every entry, overlay and local file at or beneath `entry`.
    fn remove_subtree(&self, entry: &PathEntry) -> Result<(), VfsError> {
        let mut doomed: Vec<PathEntry> = self
            .store
            .entries()
            .into_iter()
            .filter(|e| e.path.starts_with(&entry.path))
            .collect();
        doomed.sort_by(|a, b| b.path.depth().cmp(&a.path.depth()));
        for e in &doomed {
            next_state(e.state, Transition::Delete, e.is_directory)?;
            self.store.remove(&e.path)?;
        }
        self.local.remove(&entry.path)?;
        if entry.is_directory {
            self.overlays.forget_subtree(&entry.path)?;
        }
        Ok(())
    }

    fn import(&self, source: &Path, to: &VirtualPath, replace_existing: bool) -> Result<(), VfsError> {
        if to.is_root() {
            return Err(VfsError::InvalidPath("cannot import over the root".to_string()));
        }
        let metadata: std::fs::Metadata = match std::fs::metadata(source) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VfsError::PathNotFound(source.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let _guard: PathGuard = self.locks.lock_path(to);
        self.require_parent(to)?;
        if let Some(existing) = self.resolve(to)? {
            if !replace_existing {
                return Err(VfsError::DestinationExists(to.to_string()));
            }
            if existing.is_directory || metadata.is_dir() || self.is_protected(to) {
                return Err(VfsError::AccessDenied(format!("cannot replace {}", to)));
            }
            if !self.handles.on_path(to, None).is_empty() {
                return Err(VfsError::AccessDenied(format!("{} is open", to)));
            }
            next_state(existing.state, Transition::Delete, existing.is_directory)?;
            if !self.store.compare_and_set(to, existing.state, None)? {
                return Err(VfsError::LostRace(to.to_string()));
            }
            self.local.remove(to)?;
        }

        self.import_subtree(source, to)?;
        if metadata.is_dir() {
            std::fs::remove_dir_all(source)?;
        } else {
            std::fs::remove_file(source)?;
        }

        tracing::debug!("Imported {} as {}", source.display(), to);
        self.notify(if metadata.is_dir() {
            BackgroundTask::FolderCreated(to.to_string())
        } else {
            BackgroundTask::FileCreated(to.to_string())
        });
        Ok(())
    }

    fn import_subtree(&self, source: &Path, to: &VirtualPath) -> Result<(), VfsError> {
        if source.is_dir() {
            self.insert_local(to, true, &[])?;
            for item in std::fs::read_dir(source)? {
                let item = item?;
                let name: String = item.file_name().to_string_lossy().into_owned();
                self.import_subtree(&item.path(), &to.join(&name))?;
            }
            return Ok(());
        }
        let data: Vec<u8> = std::fs::read(source)?;
        self.insert_local(to, false, &data)?;
        Ok(())
    }

    fn query(&self, path: &VirtualPath) -> Result<FileAttributes, VfsError> {
        let _guard: PathGuard = self.locks.lock_path(path);
        let entry: PathEntry = self
            .resolve(path)?
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        let version: Option<PlaceholderVersion> = entry.version()?;
        let size: u64 = if entry.path.is_root() {
            0
        } else {
            self.entry_size(&entry)?
        };
        Ok(FileAttributes {
            path: entry.path,
            is_directory: entry.is_directory,
            size,
            state: entry.state,
            version,
        })
    }

    fn enumerate(
        &self,
        context: &SharedContext,
        restart: bool,
        max_bytes: usize,
        filter: Option<&str>,
    ) -> Result<EnumerationReply, VfsError> {
        let (is_directory, session): (bool, EnumerationSession) = {
            let ctx = context.lock();
            (ctx.is_directory, ctx.enumeration.clone())
        };
        if !is_directory {
            return Err(VfsError::NotADirectory(context.lock().path.to_string()));
        }

        let page: EnumerationPage = match (restart, session) {
            (false, EnumerationSession::Finished) => return Ok(EnumerationReply {
                entries: Vec::new(),
                finished: true,
            }),
            (false, EnumerationSession::InProgress(token)) => {
                let _guard: PathGuard = self.locks.lock_path(token.dir());
                let page: EnumerationPage = self.merger.list_children(
                    token.dir(),
                    ListingSource::Projected,
                    Some(&token),
                    max_bytes,
                    None,
                )?;
                self.discover_listed(token.dir(), &page.entries)?;
                page
            }
            _ => {
                let (path, _guard) = self.lock_handle(context)?;
                let entry: PathEntry = self
                    .resolve(&path)?
                    .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
                let page: EnumerationPage = self.merger.list_children(
                    &path,
                    source_of(&entry),
                    None,
                    max_bytes,
                    filter,
                )?;
                self.discover_listed(&path, &page.entries)?;
                page
            }
        };

        let finished: bool = page.next.is_none();
        context.lock().enumeration = match page.next {
            Some(token) => EnumerationSession::InProgress(token),
            None => EnumerationSession::Finished,
        };
        Ok(EnumerationReply {
            entries: page.entries,
            finished,
        })
    }

    /// Record listed backing children as `Virtual`, unless the directory has
    /// since been removed or moved.
    fn discover_listed(&self, dir: &VirtualPath, entries: &[DirEntry]) -> Result<(), VfsError> {
        if !dir.is_root() && self.store.get(dir).is_none() {
            return Ok(());
        }
        let overlay = self.overlays.get(dir);
        let removed = |name: &str| overlay.as_ref().is_some_and(|o| o.is_deleted(name));
        for child in entries
            .iter()
            .filter(|c| c.version.is_some() && !removed(&c.name))
        {
            let child_path: VirtualPath = dir.join(&child.name);
            if self.store.get(&child_path).is_none() {
                self.discover(&child_path, child.is_directory)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_projection_vfs::MemoryBackingStore;

    fn p(path: &str) -> VirtualPath {
        VirtualPath::new(path).unwrap()
    }

    fn setup(files: &[(&str, &[u8])]) -> (Arc<MemoryBackingStore>, Dispatcher) {
        let backing = Arc::new(MemoryBackingStore::new());
        for (path, data) in files {
            backing.insert_file(path, data);
        }
        let dispatcher = Dispatcher::new(FilterOptions::default(), backing.clone()).unwrap();
        (backing, dispatcher)
    }

    fn state_of(dispatcher: &Dispatcher, path: &str) -> Option<PathState> {
        dispatcher.state_store().get(&p(path)).map(|e| e.state)
    }

    #[test]
    fn test_query_discovers_virtual() {
        let (_backing, dispatcher) = setup(&[("src/main.rs", b"fn main() {}")]);
        assert_eq!(state_of(&dispatcher, "src/main.rs"), None);

        let attrs: FileAttributes = dispatcher.on_query_attributes(&p("SRC/MAIN.RS")).unwrap();
        assert_eq!(attrs.path.as_str(), "src/main.rs");
        assert_eq!(attrs.size, 12);
        assert_eq!(attrs.state, PathState::Virtual);
        assert_eq!(state_of(&dispatcher, "src/main.rs"), Some(PathState::Virtual));
        assert_eq!(state_of(&dispatcher, "src"), Some(PathState::Virtual));
    }

    #[test]
    fn test_open_creates_placeholder_and_read_materializes() {
        let (backing, dispatcher) = setup(&[("a.txt", b"hello world")]);

        let handle: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();
        assert_eq!(state_of(&dispatcher, "a.txt"), Some(PathState::Placeholder));
        assert_eq!(backing.fetch_count(), 0);

        assert_eq!(dispatcher.on_read(handle, 6, 100).unwrap(), b"world");
        assert_eq!(state_of(&dispatcher, "a.txt"), Some(PathState::Full));
        assert_eq!(dispatcher.on_read(handle, 0, 5).unwrap(), b"hello");
        assert_eq!(backing.fetch_count(), 1);

        dispatcher.on_close(handle).unwrap();
        assert_eq!(dispatcher.open_handles(), 0);
        assert_eq!(dispatcher.stats().materializations, 1);
    }

    #[test]
    fn test_open_missing_path() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"a")]);
        assert_eq!(
            dispatcher.on_create(&p("missing.txt"), OpenOptions::read()),
            Err(Status::ObjectNameNotFound)
        );
        assert_eq!(
            dispatcher.on_create(&p("nodir/file.txt"), OpenOptions::create_file()),
            Err(Status::ObjectNameNotFound)
        );
        assert_eq!(
            dispatcher.on_create(&p("a.txt/child"), OpenOptions::create_file()),
            Err(Status::NotADirectory)
        );
    }

    #[test]
    fn test_create_local_file() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"a")]);

        let handle: HandleId = dispatcher.on_create(&p("new.txt"), OpenOptions::create_file()).unwrap();
        assert_eq!(dispatcher.on_write(handle, 0, b"fresh").unwrap(), 5);
        dispatcher.on_close(handle).unwrap();

        assert_eq!(state_of(&dispatcher, "new.txt"), Some(PathState::Local));
        assert_eq!(dispatcher.on_query_attributes(&p("new.txt")).unwrap().size, 5);
        assert_eq!(
            dispatcher.on_create(&p("NEW.txt"), OpenOptions::create_file()),
            Err(Status::ObjectNameCollision)
        );

        assert!(dispatcher.wait_for_notifications(Duration::from_secs(5)));
        let summary: ModificationSummary = dispatcher.modification_summary();
        assert_eq!(summary.created_files, vec!["new.txt".to_string()]);
    }

    #[test]
    fn test_write_materializes_first() {
        let (backing, dispatcher) = setup(&[("a.txt", b"abcdef")]);

        let handle: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::write()).unwrap();
        assert_eq!(state_of(&dispatcher, "a.txt"), Some(PathState::Full));
        dispatcher.on_write(handle, 2, b"XY").unwrap();
        assert_eq!(dispatcher.on_read(handle, 0, 10).unwrap(), b"abXYef");
        assert_eq!(backing.fetch_count(), 1);
        dispatcher.on_close(handle).unwrap();

        assert!(dispatcher.wait_for_notifications(Duration::from_secs(5)));
        assert_eq!(
            dispatcher.modification_summary().modified_files,
            vec!["a.txt".to_string()]
        );
    }

    #[test]
    fn test_write_out_of_range_is_invalid_parameter() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"abc")]);

        let handle: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::write()).unwrap();
        assert_eq!(
            dispatcher.on_write(handle, u64::MAX, b"x"),
            Err(Status::InvalidParameter)
        );
        assert_eq!(dispatcher.on_read(handle, 0, 10).unwrap(), b"abc");
        dispatcher.on_close(handle).unwrap();
    }

    #[test]
    fn test_overwrite_skips_fetch() {
        let (backing, dispatcher) = setup(&[("a.txt", b"old content")]);

        let options = OpenOptions::write().with_disposition(CreateDisposition::OverwriteIf);
        let handle: HandleId = dispatcher.on_create(&p("a.txt"), options).unwrap();
        assert_eq!(state_of(&dispatcher, "a.txt"), Some(PathState::Full));
        assert!(dispatcher.on_read(handle, 0, 100).unwrap().is_empty());
        assert_eq!(backing.fetch_count(), 0);
        dispatcher.on_close(handle).unwrap();
    }

    #[test]
    fn test_access_checks() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"a")]);

        let reader: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();
        assert_eq!(dispatcher.on_write(reader, 0, b"x"), Err(Status::AccessDenied));
        assert_eq!(
            dispatcher.on_delete(reader, DeleteDisposition::SetDisposition),
            Err(Status::AccessDenied)
        );

        let exclusive = OpenOptions::read().with_share(AccessMask::NONE);
        assert_eq!(dispatcher.on_create(&p("a.txt"), exclusive), Err(Status::AccessDenied));
        dispatcher.on_close(reader).unwrap();
        assert_eq!(dispatcher.on_close(reader), Err(Status::InvalidHandle));
    }

    #[test]
    fn test_directory_flags() {
        let (_backing, dispatcher) = setup(&[("dir/a.txt", b"a")]);
        assert_eq!(dispatcher.on_create(&p("dir/a.txt"), OpenOptions::dir()), Err(Status::NotADirectory));
        assert_eq!(dispatcher.on_create(&p("dir"), OpenOptions::write()), Err(Status::FileIsADirectory));

        let dir: HandleId = dispatcher.on_create(&p("dir"), OpenOptions::dir()).unwrap();
        assert_eq!(dispatcher.on_read(dir, 0, 1), Err(Status::FileIsADirectory));
        dispatcher.on_close(dir).unwrap();
    }

    #[test]
    fn test_empty_virtual_directory_stays_collapsed() {
        let backing = Arc::new(MemoryBackingStore::new());
        backing.insert_dir("empty");
        let dispatcher = Dispatcher::new(FilterOptions::default(), backing.clone()).unwrap();

        let handle: HandleId = dispatcher.on_create(&p("empty"), OpenOptions::dir()).unwrap();
        assert_eq!(state_of(&dispatcher, "empty"), Some(PathState::Virtual));
        dispatcher.on_close(handle).unwrap();
    }

    #[test]
    fn test_enumerate_root_pages() {
        let (_backing, dispatcher) = setup(&[("b.txt", b"b"), ("a.txt", b"a"), ("c.txt", b"c")]);
        let handle: HandleId = dispatcher.on_create(&VirtualPath::root(), OpenOptions::dir()).unwrap();

        let first: EnumerationReply = dispatcher.on_enumerate(handle, false, 170, None).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(!first.finished);
        let second: EnumerationReply = dispatcher.on_enumerate(handle, false, 170, None).unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.finished);
        assert!(dispatcher.on_enumerate(handle, false, 170, None).unwrap().entries.is_empty());

        assert_eq!(state_of(&dispatcher, "c.txt"), Some(PathState::Virtual));

        let again: EnumerationReply = dispatcher.on_enumerate(handle, true, 4096, Some("b*")).unwrap();
        let names: Vec<&str> = again.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.txt"]);
        dispatcher.on_close(handle).unwrap();
    }

    #[test]
    fn test_enumerate_buffer_too_small() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"a")]);
        let handle: HandleId = dispatcher.on_create(&VirtualPath::root(), OpenOptions::dir()).unwrap();
        assert_eq!(dispatcher.on_enumerate(handle, false, 8, None), Err(Status::BufferTooSmall));
    }

    #[test]
    fn test_delete_on_close_removes_entry() {
        let (_backing, dispatcher) = setup(&[("a.txt", b"a"), ("b.txt", b"b")]);

        let handle: HandleId = dispatcher
            .on_create(&p("a.txt"), OpenOptions::read().with_delete_on_close())
            .unwrap();
        dispatcher.on_close(handle).unwrap();

        assert_eq!(state_of(&dispatcher, "a.txt"), None);
        assert_eq!(
            dispatcher.on_query_attributes(&p("a.txt")),
            Err(Status::ObjectNameNotFound)
        );
        assert!(dispatcher.on_query_attributes(&p("b.txt")).is_ok());
    }

    #[test]
    fn test_root_and_protected_cannot_be_deleted() {
        let (_backing, dispatcher) = setup(&[(".git/index", b"idx")]);
        assert_eq!(
            dispatcher.on_create(&p(".git/index"), OpenOptions::read().with_delete_on_close()),
            Err(Status::AccessDenied)
        );

        let root: HandleId = dispatcher
            .on_create(&VirtualPath::root(), OpenOptions::dir().with_access(AccessMask::READ.with_delete()))
            .unwrap();
        assert_eq!(
            dispatcher.on_delete(root, DeleteDisposition::SetDisposition),
            Err(Status::AccessDenied)
        );
    }

    #[test]
    fn test_failed_fetch_leaves_placeholder() {
        let (backing, dispatcher) = setup(&[("slow.bin", b"payload")]);
        let handle: HandleId = dispatcher.on_create(&p("slow.bin"), OpenOptions::read()).unwrap();

        backing.set_fail_fetches(true);
        assert_eq!(dispatcher.on_read(handle, 0, 10), Err(Status::IoDevice));
        assert_eq!(state_of(&dispatcher, "slow.bin"), Some(PathState::Placeholder));

        backing.set_fail_fetches(false);
        dispatcher.on_cancel(handle).unwrap();
        assert_eq!(dispatcher.on_read(handle, 0, 10).unwrap(), b"payload");
        assert_eq!(dispatcher.stats().failures, 1);
    }

    #[test]
    fn test_stale_placeholder_is_refreshed() {
        let (backing, dispatcher) = setup(&[("a.txt", b"v1")]);
        let handle: HandleId = dispatcher.on_create(&p("a.txt"), OpenOptions::read()).unwrap();

        backing.update_file("a.txt", b"v2");
        assert_eq!(dispatcher.on_read(handle, 0, 10).unwrap(), b"v2");
        assert_eq!(dispatcher.stats().stale_refreshes, 1);
    }

    #[test]
    fn test_invalid_root_path() {
        let backing = Arc::new(MemoryBackingStore::new());
        let options = FilterOptions::new(PathBuf::from("/definitely/not/a/real/root"));
        assert!(matches!(
            Dispatcher::new(options, backing),
            Err(FilterError::InvalidRootPath(_))
        ));
    }
}
