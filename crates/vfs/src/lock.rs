//! Per-path advisory locks.
//!
//! Every operation locks its target and the target's parent directory.
//! Locks are always taken shallowest first (then by key), so two operations
//! touching overlapping paths, such as a rename pair running in both
//! directions, cannot deadlock.
//!
//! The table keeps one mutex per path touched. Once it grows past the prune
//! threshold, entries nobody holds are dropped and the threshold moves to
//! twice the surviving size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::path::VirtualPath;

/// Held set of path locks, released on drop.
pub struct PathGuard {
    /// Locked keys in acquisition order.
    keys: Vec<String>,
    /// Guards, same order as `keys`.
    _guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl PathGuard {
    /// Check whether this guard holds the lock for `path`.
    pub fn covers(&self, path: &VirtualPath) -> bool {
        self.keys.iter().any(|k| k == path.key())
    }

    /// Locked keys in acquisition order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl std::fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathGuard").field("keys", &self.keys).finish()
    }
}

/// Table size that triggers the first prune.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 4096;

/// Table of per-path mutexes.
pub struct LockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Smallest threshold the table is pruned at.
    min_prune_threshold: usize,
    /// Current table size that triggers a prune.
    prune_at: AtomicUsize,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::with_prune_threshold(DEFAULT_PRUNE_THRESHOLD)
    }

    /// Create an empty lock table that prunes idle entries once it holds
    /// more than `threshold` of them.
    pub fn with_prune_threshold(threshold: usize) -> Self {
        let threshold: usize = threshold.max(1);
        Self {
            locks: DashMap::new(),
            min_prune_threshold: threshold,
            prune_at: AtomicUsize::new(threshold),
        }
    }

    /// Lock a path and its parent directory.
    pub fn lock_path(&self, path: &VirtualPath) -> PathGuard {
        self.lock_paths(&[path.clone()])
    }

    /// Lock two paths and both parent directories (rename source and
    /// destination).
    pub fn lock_pair(&self, a: &VirtualPath, b: &VirtualPath) -> PathGuard {
        self.lock_paths(&[a.clone(), b.clone()])
    }

    /// Lock a set of paths plus their parents in canonical order.
    ///
    /// # Arguments
    /// * `paths` - Target paths; duplicates are collapsed
    pub fn lock_paths(&self, paths: &[VirtualPath]) -> PathGuard {
        self.acquire(paths, &[])
    }

    /// Lock a path beneath a directory the caller already holds.
    ///
    /// Keys already in `held` are skipped. `path` must lie strictly below
    /// the deepest held key so the canonical order is preserved.
    ///
    /// # Arguments
    /// * `held` - Guard covering an ancestor of `path`
    /// * `path` - Descendant to lock along with its parent
    pub fn lock_beneath(&self, held: &PathGuard, path: &VirtualPath) -> PathGuard {
        self.acquire(std::slice::from_ref(path), held.keys())
    }

    fn acquire(&self, paths: &[VirtualPath], skip: &[String]) -> PathGuard {
        self.maybe_prune();

        let mut targets: Vec<VirtualPath> = Vec::with_capacity(paths.len() * 2);
        for path in paths {
            if let Some(parent) = path.parent() {
                targets.push(parent);
            }
            targets.push(path.clone());
        }

        targets.retain(|t| !skip.iter().any(|k| k == t.key()));
        targets.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.key().cmp(b.key())));
        targets.dedup();

        let mut keys: Vec<String> = Vec::with_capacity(targets.len());
        let mut guards: Vec<ArcMutexGuard<RawMutex, ()>> = Vec::with_capacity(targets.len());
        for target in targets {
            let mutex: Arc<Mutex<()>> = self
                .locks
                .entry(target.key().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_arc());
            keys.push(target.key().to_string());
        }

        PathGuard {
            keys,
            _guards: guards,
        }
    }

    /// Drop lock entries nobody holds or waits on.
    ///
    /// # Returns
    /// Number of entries removed.
    pub fn prune(&self) -> usize {
        let before: usize = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    fn maybe_prune(&self) {
        if self.locks.len() <= self.prune_at.load(Ordering::Relaxed) {
            return;
        }
        let removed: usize = self.prune();
        let next: usize = (self.locks.len() * 2).max(self.min_prune_threshold);
        self.prune_at.store(next, Ordering::Relaxed);
        tracing::debug!("Pruned {} idle path locks, next prune at {}", removed, next);
    }

    /// Number of lock entries.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
