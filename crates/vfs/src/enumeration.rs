//! Enumeration Merger: directory listings merged from the backing store and
//! local overlays, paged to caller-supplied buffer sizes.
//!
//! A listing sequence starts from a snapshot taken on its first call; the
//! snapshot travels inside the continuation token, so later pages never see
//! entries appear or vanish, even if the directory changes meanwhile.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::backing::{BackingEntry, BackingStore, FetchError};
use crate::compare::{file_name_compare, file_name_eq};
use crate::executor::AsyncExecutor;
use crate::metadata::PlaceholderVersion;
use crate::overlay::{DirectoryOverlay, DirectoryOverlays};
use crate::path::VirtualPath;
use crate::wildcard::name_matches;
use crate::VfsError;

/// Fixed per-entry cost in a page, before the UTF-16 name.
pub const DEFAULT_ENTRY_HEADER_SIZE: usize = 64;

/// One entry in a merged listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Child name (case preserved).
    pub name: String,
    /// Whether the child is a directory.
    pub is_directory: bool,
    /// Size in bytes as listed.
    pub size: u64,
    /// Backing identity, for children that come from the backing listing.
    pub version: Option<PlaceholderVersion>,
}

impl DirEntry {
    fn from_backing(entry: &BackingEntry) -> Self {
        Self {
            name: entry.name.clone(),
            is_directory: entry.is_directory,
            size: entry.size,
            version: Some(entry.version()),
        }
    }
}

/// Where a directory's children come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListingSource {
    /// Backing listing merged with the overlay.
    Projected,
    /// Overlay only (locally created directories).
    LocalOnly,
}

/// Opaque, caller-held position in a listing sequence.
#[derive(Clone)]
pub struct ContinuationToken {
    /// Directory being listed.
    dir: VirtualPath,
    /// Listing as of the first call.
    items: Arc<[DirEntry]>,
    /// Next position in items.
    index: usize,
    /// Search expression captured for this sequence.
    filter: Option<String>,
}

impl ContinuationToken {
    /// Directory this token belongs to.
    pub fn dir(&self) -> &VirtualPath {
        &self.dir
    }

    /// Check if every entry has been returned.
    pub fn is_finished(&self) -> bool {
        self.index >= self.items.len()
    }

    fn current(&self) -> Option<&DirEntry> {
        self.items.get(self.index)
    }

    fn skip_filtered(&mut self) {
        while let Some(item) = self.current() {
            if self.matches_filter(item) {
                break;
            }
            self.index += 1;
        }
    }

    fn move_next(&mut self) {
        self.index += 1;
        self.skip_filtered();
    }

    fn matches_filter(&self, item: &DirEntry) -> bool {
        match &self.filter {
            None => true,
            Some(pattern) => name_matches(&item.name, pattern),
        }
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationToken")
            .field("dir", &self.dir)
            .field("index", &self.index)
            .field("len", &self.items.len())
            .finish()
    }
}

/// One page of a listing.
#[derive(Debug)]
pub struct EnumerationPage {
    /// Entries that fit in the page, in canonical order.
    pub entries: Vec<DirEntry>,
    /// Token for the next page, or None when the listing is complete.
    pub next: Option<ContinuationToken>,
}

/// Merges backing listings with directory overlays.
pub struct EnumerationMerger {
    /// Backing store.
    backing: Arc<dyn BackingStore>,
    /// Async bridge for backing calls.
    executor: Arc<AsyncExecutor>,
    /// Local overlays.
    overlays: Arc<DirectoryOverlays>,
    /// Backing listings by directory key.
    cache: DashMap<String, Arc<[BackingEntry]>>,
    /// Deadline for a backing listing.
    fetch_timeout: Duration,
    /// Fixed cost per entry in a page.
    entry_header_size: usize,
}

impl EnumerationMerger {
    /// Create a merger.
    ///
    /// # Arguments
    /// * `backing` - Backing store to list from
    /// * `executor` - Async bridge
    /// * `overlays` - Local overlays
    /// * `fetch_timeout` - Deadline for one backing listing
    pub fn new(
        backing: Arc<dyn BackingStore>,
        executor: Arc<AsyncExecutor>,
        overlays: Arc<DirectoryOverlays>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            backing,
            executor,
            overlays,
            cache: DashMap::new(),
            fetch_timeout,
            entry_header_size: DEFAULT_ENTRY_HEADER_SIZE,
        }
    }

    /// Set the fixed per-entry page cost.
    pub fn with_entry_header_size(mut self, size: usize) -> Self {
        self.entry_header_size = size;
        self
    }

    /// Bytes one entry occupies in a page (8-byte aligned).
    pub fn entry_size(&self, name: &str) -> usize {
        let raw: usize = self.entry_header_size + name.encode_utf16().count() * 2;
        (raw + 7) & !7
    }

    /// Overlay set this merger reads.
    pub fn overlays(&self) -> &Arc<DirectoryOverlays> {
        &self.overlays
    }

    /// Backing listing for a directory.
    ///
    /// A directory the backing store does not know lists as empty.
    ///
    /// # Arguments
    /// * `dir` - Directory to list
    /// * `use_cache` - Serve from (and fill) the listing cache
    pub fn backing_listing(
        &self,
        dir: &VirtualPath,
        use_cache: bool,
    ) -> Result<Arc<[BackingEntry]>, VfsError> {
        if use_cache {
            if let Some(cached) = self.cache.get(dir.key()) {
                return Ok(cached.value().clone());
            }
        }

        let backing: Arc<dyn BackingStore> = self.backing.clone();
        let target: VirtualPath = dir.clone();
        let result: Result<Vec<BackingEntry>, FetchError> = self
            .executor
            .block_on_timeout(
                async move { backing.list_entries(&target).await },
                self.fetch_timeout,
            )?;

        let listing: Arc<[BackingEntry]> = match result {
            Ok(entries) => Arc::from(entries),
            Err(FetchError::NotFound) => Arc::from(Vec::new()),
            Err(e) => {
                tracing::warn!("Listing {} failed: {}", dir, e);
                return Err(VfsError::ContentUnavailable {
                    path: dir.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        tracing::debug!("Listed {} backing entries for {}", listing.len(), dir);
        self.cache.insert(dir.key().to_string(), listing.clone());
        Ok(listing)
    }

    /// Full merged listing of a directory in canonical order.
    ///
    /// # Arguments
    /// * `dir` - Directory to list
    /// * `source` - Whether the backing listing participates
    pub fn merged(&self, dir: &VirtualPath, source: ListingSource) -> Result<Vec<DirEntry>, VfsError> {
        let overlay: Option<DirectoryOverlay> = self.overlays.get(dir);
        let projected: bool = source == ListingSource::Projected
            && !overlay.as_ref().is_some_and(|o| o.is_expanded());

        let mut entries: Vec<DirEntry> = Vec::new();
        if projected {
            let listing: Arc<[BackingEntry]> = self.backing_listing(dir, true)?;
            entries.extend(
                listing
                    .iter()
                    .filter(|e| match &overlay {
                        Some(o) => !o.is_deleted(&e.name) && o.created_child(&e.name).is_none(),
                        None => true,
                    })
                    .map(DirEntry::from_backing),
            );
        }

        if let Some(overlay) = &overlay {
            entries.extend(overlay.created().map(|child| DirEntry {
                name: child.name.clone(),
                is_directory: child.is_directory,
                size: child.size,
                version: None,
            }));
        }

        entries.sort_by(|a, b| file_name_compare(&a.name, &b.name));
        Ok(entries)
    }

    /// Look up one child in the merged listing.
    ///
    /// Consults the overlay first and scans the cached backing listing only
    /// when the overlay does not decide.
    pub fn find_child(
        &self,
        dir: &VirtualPath,
        name: &str,
        source: ListingSource,
    ) -> Result<Option<DirEntry>, VfsError> {
        let decided: Option<Option<DirEntry>> = self.overlays.with_overlay(dir, |overlay| {
            let overlay: &DirectoryOverlay = match overlay {
                Some(o) => o,
                None if source == ListingSource::Projected => return None,
                None => return Some(None),
            };
            if let Some(child) = overlay.created_child(name) {
                return Some(Some(DirEntry {
                    name: child.name.clone(),
                    is_directory: child.is_directory,
                    size: child.size,
                    version: None,
                }));
            }
            if source == ListingSource::LocalOnly
                || overlay.is_expanded()
                || overlay.is_deleted(name)
            {
                return Some(None);
            }
            None
        });
        if let Some(found) = decided {
            return Ok(found);
        }

        let listing: Arc<[BackingEntry]> = self.backing_listing(dir, true)?;
        Ok(listing
            .iter()
            .find(|e| file_name_eq(&e.name, name))
            .map(DirEntry::from_backing))
    }

    /// Whether the merged listing of a directory has any child.
    pub fn has_children(&self, dir: &VirtualPath, source: ListingSource) -> Result<bool, VfsError> {
        let decided: Option<bool> = self.overlays.with_overlay(dir, |overlay| match overlay {
            Some(o) if o.created().next().is_some() => Some(true),
            Some(o) if source == ListingSource::LocalOnly || o.is_expanded() => Some(false),
            None if source == ListingSource::LocalOnly => Some(false),
            _ => None,
        });
        if let Some(answer) = decided {
            return Ok(answer);
        }

        let listing: Arc<[BackingEntry]> = self.backing_listing(dir, true)?;
        Ok(self.overlays.with_overlay(dir, |overlay| {
            listing
                .iter()
                .any(|e| !overlay.is_some_and(|o| o.is_deleted(&e.name)))
        }))
    }

    /// Re-read a child's backing identity, bypassing the cache.
    ///
    /// # Returns
    /// The child's current backing entry, or None if the backing store no
    /// longer lists it.
    pub fn refresh_child(
        &self,
        dir: &VirtualPath,
        name: &str,
    ) -> Result<Option<BackingEntry>, VfsError> {
        let listing: Arc<[BackingEntry]> = self.backing_listing(dir, false)?;
        Ok(listing.iter().find(|e| file_name_eq(&e.name, name)).cloned())
    }

    /// Produce one page of a listing sequence.
    ///
    /// # Arguments
    /// * `dir` - Directory to list
    /// * `source` - Whether the backing listing participates
    /// * `token` - Position from the previous page, or None to (re)start
    /// * `max_bytes` - Page capacity
    /// * `filter` - Search expression, used only when starting a sequence
    ///
    /// # Returns
    /// Entries that fit plus the next token; `BufferTooSmall` if the next
    /// entry cannot fit even in an empty page.
    pub fn list_children(
        &self,
        dir: &VirtualPath,
        source: ListingSource,
        token: Option<&ContinuationToken>,
        max_bytes: usize,
        filter: Option<&str>,
    ) -> Result<EnumerationPage, VfsError> {
        let mut position: ContinuationToken = match token {
            Some(token) => {
                if token.dir != *dir {
                    return Err(VfsError::InvalidPath(format!(
                        "continuation token for {} used on {}",
                        token.dir, dir
                    )));
                }
                token.clone()
            }
            None => {
                let items: Vec<DirEntry> = self.merged(dir, source)?;
                let mut fresh = ContinuationToken {
                    dir: dir.clone(),
                    items: Arc::from(items),
                    index: 0,
                    filter: filter.filter(|f| !f.is_empty()).map(str::to_string),
                };
                fresh.skip_filtered();
                fresh
            }
        };

        let mut entries: Vec<DirEntry> = Vec::new();
        let mut used: usize = 0;
        while let Some(item) = position.current() {
            let size: usize = self.entry_size(&item.name);
            if used + size > max_bytes {
                if entries.is_empty() {
                    return Err(VfsError::BufferTooSmall {
                        required: size,
                        available: max_bytes,
                    });
                }
                break;
            }
            used += size;
            entries.push(item.clone());
            position.move_next();
        }

        let next: Option<ContinuationToken> = if position.is_finished() {
            None
        } else {
            Some(position)
        };
        Ok(EnumerationPage { entries, next })
    }

    /// Drop the cached listing of one directory.
    pub fn invalidate(&self, dir: &VirtualPath) {
        self.cache.remove(dir.key());
    }

    /// Drop every cached listing.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
