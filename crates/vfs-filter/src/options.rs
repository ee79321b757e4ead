//! Configuration options for the projection filter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusty_projection_vfs::{ExecutorConfig, DEFAULT_ENTRY_HEADER_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Configuration for one projected root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOptions {
    /// Virtualization root path.
    pub root_path: PathBuf,

    /// Directory holding the state journal. None keeps state in memory.
    pub state_dir: Option<PathBuf>,

    /// Directory holding local file content. None keeps content in memory.
    pub scratch_dir: Option<PathBuf>,

    /// Deadline for one backing-store fetch or listing.
    #[serde(with = "millis")]
    pub fetch_timeout: Duration,

    /// Attempts made after a lost compare-and-set before giving up.
    pub lost_race_retries: u32,

    /// Number of worker threads for the async executor.
    pub worker_threads: usize,

    /// Paths that can never be marked for deletion (case-insensitive).
    pub protected_paths: Vec<String>,

    /// Notifications forwarded to the modified-paths database.
    pub notifications: NotificationMask,

    /// Fixed per-entry cost of an enumeration page entry.
    pub entry_header_size: usize,
}

impl FilterOptions {
    /// Create options with specified root path.
    ///
    /// # Arguments
    /// * `root_path` - Virtualization root directory
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            state_dir: None,
            scratch_dir: None,
            fetch_timeout: Duration::from_secs(30),
            lost_race_retries: 3,
            worker_threads: 4,
            protected_paths: vec![".git/index".to_string()],
            notifications: NotificationMask::for_writable(),
            entry_header_size: DEFAULT_ENTRY_HEADER_SIZE,
        }
    }

    /// Load options from a JSON file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Arguments
    /// * `path` - Options file
    pub fn from_json_file(path: &Path) -> Result<Self, FilterError> {
        let text: String = std::fs::read_to_string(path)?;
        let options: FilterOptions = serde_json::from_str(&text)?;
        Ok(options)
    }

    /// Set the state directory.
    ///
    /// # Arguments
    /// * `dir` - Directory for `state.journal`
    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    /// Set the scratch directory for local content.
    ///
    /// # Arguments
    /// * `dir` - Directory for materialized and local files
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    /// Set the fetch timeout.
    ///
    /// # Arguments
    /// * `timeout` - Deadline for one fetch
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the lost-race retry bound.
    ///
    /// # Arguments
    /// * `retries` - Attempts after the first lost race
    pub fn with_lost_race_retries(mut self, retries: u32) -> Self {
        self.lost_race_retries = retries;
        self
    }

    /// Set worker thread count.
    ///
    /// # Arguments
    /// * `count` - Number of worker threads
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Replace the delete-protected paths.
    ///
    /// # Arguments
    /// * `paths` - Root-relative paths
    pub fn with_protected_paths(mut self, paths: Vec<String>) -> Self {
        self.protected_paths = paths;
        self
    }

    /// Set notification mask.
    ///
    /// # Arguments
    /// * `mask` - Notification mask
    pub fn with_notifications(mut self, mask: NotificationMask) -> Self {
        self.notifications = mask;
        self
    }

    /// Set the enumeration entry header size.
    pub fn with_entry_header_size(mut self, size: usize) -> Self {
        self.entry_header_size = size;
        self
    }

    /// Get executor configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_worker_threads(self.worker_threads)
            .with_default_timeout(Some(self.fetch_timeout))
    }
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

/// Notification mask for completed operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationMask {
    /// Track new file and folder creation.
    pub new_file_created: bool,
    /// Track file modifications.
    pub file_modified: bool,
    /// Track file and folder deletions.
    pub file_deleted: bool,
    /// Track renames.
    pub file_renamed: bool,
}

impl NotificationMask {
    /// Mask for writable projections (track all modifications).
    pub fn for_writable() -> Self {
        Self {
            new_file_created: true,
            file_modified: true,
            file_deleted: true,
            file_renamed: true,
        }
    }

    /// Mask with every notification off.
    pub fn for_readonly() -> Self {
        Self::default()
    }
}

/// Durations stored as whole milliseconds in options files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let options = FilterOptions::new(PathBuf::from("/work"));
        assert_eq!(options.fetch_timeout, Duration::from_secs(30));
        assert_eq!(options.lost_race_retries, 3);
        assert_eq!(options.protected_paths, vec![".git/index".to_string()]);
        assert_eq!(options.notifications, NotificationMask::for_writable());
        assert!(options.state_dir.is_none());
    }

    #[test]
    fn test_builder() {
        let options = FilterOptions::new(PathBuf::from("/work"))
            .with_fetch_timeout(Duration::from_millis(250))
            .with_lost_race_retries(0)
            .with_notifications(NotificationMask::for_readonly())
            .with_protected_paths(Vec::new());
        assert_eq!(options.fetch_timeout, Duration::from_millis(250));
        assert_eq!(options.lost_race_retries, 0);
        assert!(!options.notifications.file_modified);
        assert!(options.protected_paths.is_empty());
    }

    #[test]
    fn test_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(
            &path,
            r#"{
                "root_path": "/mnt/work",
                "state_dir": "/var/lib/projection",
                "fetch_timeout": 1500,
                "protected_paths": [".git/index", ".git/HEAD"],
                "notifications": { "file_modified": true }
            }"#,
        )
        .unwrap();

        let options = FilterOptions::from_json_file(&path).unwrap();
        assert_eq!(options.root_path, PathBuf::from("/mnt/work"));
        assert_eq!(options.state_dir, Some(PathBuf::from("/var/lib/projection")));
        assert_eq!(options.fetch_timeout, Duration::from_millis(1500));
        assert_eq!(options.protected_paths.len(), 2);
        assert!(options.notifications.file_modified);
        assert!(!options.notifications.file_deleted);
        assert_eq!(options.worker_threads, 4);
    }

    #[test]
    fn test_from_json_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FilterOptions::from_json_file(&path),
            Err(FilterError::Config(_))
        ));
    }
}
