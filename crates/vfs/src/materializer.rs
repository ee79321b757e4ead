//! Materializer: converts placeholders into locally held content.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backing::{BackingStore, FetchError};
use crate::executor::{AsyncExecutor, ExecutorError};
use crate::local::LocalStore;
use crate::lock::{LockManager, PathGuard};
use crate::metadata::{ContentId, PlaceholderVersion};
use crate::path::VirtualPath;
use crate::state::{next_state, PathEntry, PathState, Transition};
use crate::store::StateStore;
use crate::VfsError;

/// Fetches placeholder content and promotes entries to `Full`.
pub struct Materializer {
    store: Arc<dyn StateStore>,
    local: Arc<dyn LocalStore>,
    backing: Arc<dyn BackingStore>,
    executor: Arc<AsyncExecutor>,
    locks: Arc<LockManager>,
    fetch_timeout: Duration,
    /// Completed backing fetches.
    fetches: AtomicU64,
}

impl Materializer {
    /// Create a materializer.
    ///
    /// # Arguments
    /// * `store` - Path-State Store
    /// * `local` - Local content layer
    /// * `backing` - Backing store
    /// * `executor` - Async bridge
    /// * `locks` - Lock manager shared with the dispatcher
    /// * `fetch_timeout` - Deadline for one fetch
    pub fn new(
        store: Arc<dyn StateStore>,
        local: Arc<dyn LocalStore>,
        backing: Arc<dyn BackingStore>,
        executor: Arc<AsyncExecutor>,
        locks: Arc<LockManager>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            local,
            backing,
            executor,
            locks,
            fetch_timeout,
            fetches: AtomicU64::new(0),
        }
    }

    /// Materialize a path, taking its lock.
    ///
    /// # Arguments
    /// * `path` - Path in `Placeholder` (or already `Full`)
    ///
    /// # Returns
    /// The file content.
    pub fn materialize(&self, path: &VirtualPath) -> Result<Vec<u8>, VfsError> {
        let token: CancellationToken = self.executor.operation_token();
        let guard: PathGuard = self.locks.lock_path(path);
        self.materialize_locked(path, &guard, &token)
    }

    /// Materialize a path whose lock the caller already holds.
    ///
    /// Already-`Full` paths return their local content without fetching.
    /// On cancellation or fetch failure the entry stays `Placeholder`.
    ///
    /// # Arguments
    /// * `path` - Target path
    /// * `guard` - Lock guard covering `path`
    /// * `token` - Cancels the fetch
    pub fn materialize_locked(
        &self,
        path: &VirtualPath,
        guard: &PathGuard,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, VfsError> {
        debug_assert!(guard.covers(path));

        let entry: PathEntry = self
            .store
            .get(path)
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;

        if entry.state == PathState::Full {
            return self.local.read_all(path);
        }
        let target: PathState = next_state(entry.state, Transition::Materialize, entry.is_directory)?;

        let version: PlaceholderVersion = entry.require_version()?;
        let data: Vec<u8> = self.fetch(path, &version, token)?;

        self.local.write_all(path, &data)?;
        if !self
            .store
            .compare_and_set(path, PathState::Placeholder, Some(entry.with_state(target)))?
        {
            self.local.remove(path)?;
            return Err(VfsError::LostRace(path.to_string()));
        }

        tracing::debug!("Materialized {} ({} bytes)", path, data.len());
        Ok(data)
    }

    /// Number of completed backing fetches.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn fetch(
        &self,
        path: &VirtualPath,
        version: &PlaceholderVersion,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, VfsError> {
        let backing: Arc<dyn BackingStore> = self.backing.clone();
        let target: VirtualPath = path.clone();
        let epoch: u64 = version.epoch;
        let content_id: ContentId = version.content_id;

        tracing::debug!("Fetching {} at epoch {} ({})", path, epoch, content_id);
        let result = self.executor.block_on_cancellable_timeout(
            async move { backing.fetch_content(&target, epoch, &content_id).await },
            self.fetch_timeout,
            token,
        );

        match result {
            Ok(Ok(data)) => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                Ok(data)
            }
            Ok(Err(FetchError::Stale { current_epoch })) => Err(VfsError::StaleEpoch {
                path: path.to_string(),
                recorded: epoch,
                current: current_epoch,
            }),
            Ok(Err(e)) => Err(VfsError::ContentUnavailable {
                path: path.to_string(),
                reason: e.to_string(),
            }),
            Err(ExecutorError::Cancelled) => {
                tracing::debug!("Fetch of {} cancelled", path);
                Err(VfsError::Cancelled)
            }
            Err(e) => Err(VfsError::ContentUnavailable {
                path: path.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
