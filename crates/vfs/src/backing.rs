//! Backing object store interface.
//!
//! The backing store is content-addressed: `fetch_content` resolves bytes by
//! content id, and the path is used to detect whether the path's expected
//! content has moved to a newer epoch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::compare::file_name_compare;
use crate::metadata::{ContentId, PlaceholderVersion, CONTENT_ID_LEN};
use crate::path::VirtualPath;

/// Failure reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No content or directory for the request.
    NotFound,
    /// Path has moved to a newer epoch.
    Stale {
        /// Epoch the backing store now holds for the path.
        current_epoch: u64,
    },
    /// Transport or server failure.
    Failed(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound => write!(f, "not found in backing store"),
            FetchError::Stale { current_epoch } => {
                write!(f, "backing store moved to epoch {}", current_epoch)
            }
            FetchError::Failed(reason) => write!(f, "fetch failed: {}", reason),
        }
    }
}

impl std::error::Error for FetchError {}

/// One child in a backing-store directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingEntry {
    /// Child name (case preserved).
    pub name: String,
    /// Whether the child is a directory.
    pub is_directory: bool,
    /// Generation of the child's expected content.
    pub epoch: u64,
    /// Expected content digest.
    pub content_id: ContentId,
    /// Content size in bytes (0 for directories).
    pub size: u64,
}

impl BackingEntry {
    /// Identity to record in a placeholder.
    pub fn version(&self) -> PlaceholderVersion {
        PlaceholderVersion::new(self.epoch, self.content_id)
    }
}

/// Trait for the object store being projected.
///
/// Implement this to connect the projection to a real object store client.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch the full content for a path.
    ///
    /// # Arguments
    /// * `path` - Path the content is projected at
    /// * `epoch` - Epoch recorded in the placeholder
    /// * `content_id` - Digest recorded in the placeholder
    ///
    /// # Returns
    /// Content bytes, `Stale` if the path has a newer epoch, `NotFound` if
    /// the content is unknown.
    async fn fetch_content(
        &self,
        path: &VirtualPath,
        epoch: u64,
        content_id: &ContentId,
    ) -> Result<Vec<u8>, FetchError>;

    /// List the children of a directory in canonical order.
    ///
    /// # Arguments
    /// * `dir` - Directory to list
    ///
    /// # Returns
    /// Children, or `NotFound` if the directory does not exist.
    async fn list_entries(&self, dir: &VirtualPath) -> Result<Vec<BackingEntry>, FetchError>;
}

/// Node in the in-memory tree.
#[derive(Clone, Debug)]
struct MemoryNode {
    path: VirtualPath,
    is_directory: bool,
    epoch: u64,
    content_id: ContentId,
    size: u64,
}

/// In-memory backing store for tests and demos.
///
/// Counts fetches and listings, and can inject latency or failures.
#[derive(Default)]
pub struct MemoryBackingStore {
    /// Tree nodes by path key.
    nodes: RwLock<HashMap<String, MemoryNode>>,
    /// Content by digest.
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
    /// Current store epoch.
    epoch: AtomicU64,
    /// Number of fetch_content calls.
    fetch_count: AtomicU64,
    /// Number of list_entries calls.
    list_count: AtomicU64,
    /// Delay applied to every call.
    latency: Mutex<Option<Duration>>,
    /// Fail every fetch with `Failed`.
    fail_fetches: AtomicBool,
}

impl MemoryBackingStore {
    /// Create an empty store at epoch 1.
    pub fn new() -> Self {
        let store = Self::default();
        store.epoch.store(1, Ordering::SeqCst);
        store
    }

    /// Add a file (and any missing ancestor directories) at the current epoch.
    ///
    /// # Arguments
    /// * `path` - File path
    /// * `data` - File content
    ///
    /// # Returns
    /// The digest recorded for the content.
    pub fn insert_file(&self, path: &str, data: &[u8]) -> ContentId {
        let path: VirtualPath = match VirtualPath::new(path) {
            Ok(p) => p,
            Err(_) => return ContentId::new([0u8; CONTENT_ID_LEN]),
        };
        let content_id: ContentId = content_digest(data);
        let epoch: u64 = self.epoch.load(Ordering::SeqCst);

        self.ensure_dirs(path.ancestors(), epoch);
        self.blobs.write().insert(content_id, data.to_vec());
        self.nodes.write().insert(
            path.key().to_string(),
            MemoryNode {
                path,
                is_directory: false,
                epoch,
                content_id,
                size: data.len() as u64,
            },
        );
        content_id
    }

    /// Add an empty directory (and any missing ancestors).
    pub fn insert_dir(&self, path: &str) {
        if let Ok(path) = VirtualPath::new(path) {
            let epoch: u64 = self.epoch.load(Ordering::SeqCst);
            let mut dirs: Vec<VirtualPath> = path.ancestors();
            dirs.push(path);
            self.ensure_dirs(dirs, epoch);
        }
    }

    /// Replace a file's content under a new store epoch.
    ///
    /// # Returns
    /// The new epoch.
    pub fn update_file(&self, path: &str, data: &[u8]) -> u64 {
        let epoch: u64 = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.insert_file(path, data);
        epoch
    }

    /// Remove a path and everything beneath it.
    pub fn remove(&self, path: &str) {
        if let Ok(path) = VirtualPath::new(path) {
            self.nodes.write().retain(|_, node| !node.path.starts_with(&path));
        }
    }

    /// Current store epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of content fetches served or attempted.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of directory listings served or attempted.
    pub fn list_count(&self) -> u64 {
        self.list_count.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make every fetch fail.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    fn ensure_dirs(&self, dirs: Vec<VirtualPath>, epoch: u64) {
        let mut nodes = self.nodes.write();
        for dir in dirs.into_iter().filter(|d| !d.is_root()) {
            nodes
                .entry(dir.key().to_string())
                .or_insert_with(|| MemoryNode {
                    content_id: content_digest(dir.key().as_bytes()),
                    path: dir,
                    is_directory: true,
                    epoch,
                    size: 0,
                });
        }
    }

    async fn simulate_latency(&self) {
        let latency: Option<Duration> = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn fetch_content(
        &self,
        path: &VirtualPath,
        epoch: u64,
        content_id: &ContentId,
    ) -> Result<Vec<u8>, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FetchError::Failed("injected failure".to_string()));
        }

        let current: Option<u64> = self.nodes.read().get(path.key()).map(|n| n.epoch);
        if let Some(current_epoch) = current {
            if current_epoch > epoch {
                return Err(FetchError::Stale { current_epoch });
            }
        }

        self.blobs
            .read()
            .get(content_id)
            .cloned()
            .ok_or(FetchError::NotFound)
    }

    async fn list_entries(&self, dir: &VirtualPath) -> Result<Vec<BackingEntry>, FetchError> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let nodes = self.nodes.read();
        if !dir.is_root() {
            match nodes.get(dir.key()) {
                Some(node) if node.is_directory => {}
                _ => return Err(FetchError::NotFound),
            }
        }

        let mut entries: Vec<BackingEntry> = nodes
            .values()
            .filter(|node| node.path.parent().as_ref() == Some(dir))
            .map(|node| BackingEntry {
                name: node.path.name().to_string(),
                is_directory: node.is_directory,
                epoch: node.epoch,
                content_id: node.content_id,
                size: node.size,
            })
            .collect();
        entries.sort_by(|a, b| file_name_compare(&a.name, &b.name));
        Ok(entries)
    }
}

/// Deterministic non-cryptographic digest used by the in-memory store.
fn content_digest(data: &[u8]) -> ContentId {
    let mut out: [u8; CONTENT_ID_LEN] = [0u8; CONTENT_ID_LEN];
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for (i, slot) in out.iter_mut().enumerate() {
        hash ^= i as u64;
        for byte in data {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        *slot = (hash >> 24) as u8;
    }
    ContentId::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_root_sorted() {
        let store = MemoryBackingStore::new();
        store.insert_file("b.txt", b"b");
        store.insert_file("A.txt", b"a");
        store.insert_file("dir/c.txt", b"c");

        let names: Vec<String> = store
            .list_entries(&VirtualPath::root())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["A.txt", "b.txt", "dir"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir() {
        let store = MemoryBackingStore::new();
        store.insert_file("file", b"x");
        let missing = VirtualPath::new("nope").unwrap();
        assert_eq!(store.list_entries(&missing).await, Err(FetchError::NotFound));

        let file = VirtualPath::new("file").unwrap();
        assert_eq!(store.list_entries(&file).await, Err(FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_fetch_by_content_id() {
        let store = MemoryBackingStore::new();
        let id: ContentId = store.insert_file("a.txt", b"hello");
        let path = VirtualPath::new("a.txt").unwrap();

        assert_eq!(store.fetch_content(&path, 1, &id).await.unwrap(), b"hello");
        assert_eq!(store.fetch_count(), 1);

        // Content follows the id, not the path.
        let moved = VirtualPath::new("renamed.txt").unwrap();
        assert_eq!(store.fetch_content(&moved, 1, &id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_fetch_stale_after_update() {
        let store = MemoryBackingStore::new();
        let id: ContentId = store.insert_file("a.txt", b"v1");
        let new_epoch: u64 = store.update_file("a.txt", b"v2");
        let path = VirtualPath::new("a.txt").unwrap();

        assert_eq!(
            store.fetch_content(&path, 1, &id).await,
            Err(FetchError::Stale {
                current_epoch: new_epoch
            })
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryBackingStore::new();
        let id: ContentId = store.insert_file("a.txt", b"x");
        store.set_fail_fetches(true);
        let path = VirtualPath::new("a.txt").unwrap();
        assert!(matches!(
            store.fetch_content(&path, 1, &id).await,
            Err(FetchError::Failed(_))
        ));
    }

    #[test]
    fn test_digest_differs_by_content() {
        assert_ne!(content_digest(b"a"), content_digest(b"b"));
        assert_eq!(content_digest(b"a"), content_digest(b"a"));
    }
}
