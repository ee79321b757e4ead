//! Database of paths changed under the projected root.
//!
//! Tracks created, modified and deleted files and directories so a caller
//! can tell which paths diverge from the backing store. Paths are compared
//! case-insensitively and reported with the case of their latest event.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Tracked sets, keyed by lowercase path.
#[derive(Default)]
struct ModifiedSets {
    created_files: BTreeMap<String, String>,
    modified_files: BTreeMap<String, String>,
    deleted_files: BTreeMap<String, String>,
    created_dirs: BTreeMap<String, String>,
    deleted_dirs: BTreeMap<String, String>,
}

/// Database tracking modified paths.
pub struct ModifiedPathsDatabase {
    sets: RwLock<ModifiedSets>,
}

fn key(path: &str) -> String {
    path.to_lowercase()
}

fn is_beneath(candidate: &str, dir: &str) -> bool {
    candidate.len() > dir.len() && candidate.starts_with(dir) && candidate[dir.len()..].starts_with('/')
}

impl ModifiedPathsDatabase {
    /// Create new empty database.
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(ModifiedSets::default()),
        }
    }

    /// Record file creation.
    ///
    /// # Arguments
    /// * `path` - Path of created file
    pub fn file_created(&self, path: &str) {
        let mut sets = self.sets.write();
        let k: String = key(path);
        // Recreating a deleted backing file is a modification of it.
        if sets.deleted_files.remove(&k).is_some() {
            sets.modified_files.insert(k, path.to_string());
        } else {
            sets.created_files.insert(k, path.to_string());
        }
    }

    /// Record file modification.
    ///
    /// # Arguments
    /// * `path` - Path of modified file
    pub fn file_modified(&self, path: &str) {
        let mut sets = self.sets.write();
        let k: String = key(path);
        if !sets.created_files.contains_key(&k) {
            sets.modified_files.insert(k, path.to_string());
        }
    }

    /// Record file deletion.
    ///
    /// # Arguments
    /// * `path` - Path of deleted file
    pub fn file_deleted(&self, path: &str) {
        let mut sets = self.sets.write();
        let k: String = key(path);

        // Created this session: no net change.
        if sets.created_files.remove(&k).is_some() {
            return;
        }
        sets.modified_files.remove(&k);
        sets.deleted_files.insert(k, path.to_string());
    }

    /// Record file rename.
    ///
    /// # Arguments
    /// * `old_path` - Original path
    /// * `new_path` - New path
    pub fn file_renamed(&self, old_path: &str, new_path: &str) {
        self.file_deleted(old_path);
        self.file_created(new_path);
    }

    /// Record directory creation.
    ///
    /// # Arguments
    /// * `path` - Path of created directory
    pub fn dir_created(&self, path: &str) {
        let mut sets = self.sets.write();
        let k: String = key(path);
        if sets.deleted_dirs.remove(&k).is_none() {
            sets.created_dirs.insert(k, path.to_string());
        }
    }

    /// Record directory deletion.
    ///
    /// Files and directories created beneath it this session are dropped.
    ///
    /// # Arguments
    /// * `path` - Path of deleted directory
    pub fn dir_deleted(&self, path: &str) {
        let mut sets = self.sets.write();
        let k: String = key(path);

        sets.created_files.retain(|p, _| !is_beneath(p, &k));
        sets.modified_files.retain(|p, _| !is_beneath(p, &k));
        sets.created_dirs.retain(|p, _| !is_beneath(p, &k));

        if sets.created_dirs.remove(&k).is_some() {
            return;
        }
        sets.deleted_dirs.insert(k, path.to_string());
    }

    /// Record directory rename.
    ///
    /// # Arguments
    /// * `old_path` - Original path
    /// * `new_path` - New path
    pub fn dir_renamed(&self, old_path: &str, new_path: &str) {
        self.dir_deleted(old_path);
        self.dir_created(new_path);
    }

    /// Get summary of all modifications.
    ///
    /// # Returns
    /// Summary containing all tracked modifications, each list sorted.
    pub fn get_summary(&self) -> ModificationSummary {
        let sets = self.sets.read();
        let values = |map: &BTreeMap<String, String>| map.values().cloned().collect::<Vec<_>>();
        ModificationSummary {
            created_files: values(&sets.created_files),
            modified_files: values(&sets.modified_files),
            deleted_files: values(&sets.deleted_files),
            created_dirs: values(&sets.created_dirs),
            deleted_dirs: values(&sets.deleted_dirs),
        }
    }

    /// Check if any modifications recorded.
    pub fn has_modifications(&self) -> bool {
        !self.get_summary().is_empty()
    }

    /// Clear all tracked modifications.
    pub fn clear(&self) {
        *self.sets.write() = ModifiedSets::default();
    }
}

impl Default for ModifiedPathsDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of all modifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModificationSummary {
    /// Files created during this session.
    pub created_files: Vec<String>,
    /// Files modified during this session.
    pub modified_files: Vec<String>,
    /// Files deleted during this session.
    pub deleted_files: Vec<String>,
    /// Directories created during this session.
    pub created_dirs: Vec<String>,
    /// Directories deleted during this session.
    pub deleted_dirs: Vec<String>,
}

impl ModificationSummary {
    /// Check if summary is empty (no modifications).
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Get total count of all modifications.
    pub fn total_count(&self) -> usize {
        self.created_files.len()
            + self.modified_files.len()
            + self.deleted_files.len()
            + self.created_dirs.len()
            + self.deleted_dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_created() {
        let db = ModifiedPathsDatabase::new();
        db.file_created("new_file.txt");

        let summary: ModificationSummary = db.get_summary();
        assert_eq!(summary.created_files, vec!["new_file.txt".to_string()]);
        assert!(summary.modified_files.is_empty());
        assert!(db.has_modifications());
    }

    #[test]
    fn test_file_modified_after_created_not_tracked() {
        let db = ModifiedPathsDatabase::new();
        db.file_created("new_file.txt");
        db.file_modified("NEW_FILE.txt");

        let summary: ModificationSummary = db.get_summary();
        assert_eq!(summary.created_files.len(), 1);
        assert!(summary.modified_files.is_empty());
    }

    #[test]
    fn test_file_created_then_deleted_no_net_change() {
        let db = ModifiedPathsDatabase::new();
        db.file_created("new_file.txt");
        db.file_deleted("new_file.txt");

        assert!(db.get_summary().is_empty());
        assert!(!db.has_modifications());
    }

    #[test]
    fn test_deleted_then_recreated_is_modified() {
        let db = ModifiedPathsDatabase::new();
        db.file_deleted("tracked.txt");
        db.file_created("tracked.txt");

        let summary: ModificationSummary = db.get_summary();
        assert!(summary.deleted_files.is_empty());
        assert!(summary.created_files.is_empty());
        assert_eq!(summary.modified_files, vec!["tracked.txt".to_string()]);
    }

    #[test]
    fn test_file_renamed() {
        let db = ModifiedPathsDatabase::new();
        db.file_modified("old.txt");
        db.file_renamed("old.txt", "new.txt");

        let summary: ModificationSummary = db.get_summary();
        assert_eq!(summary.deleted_files, vec!["old.txt".to_string()]);
        assert_eq!(summary.created_files, vec!["new.txt".to_string()]);
        assert!(summary.modified_files.is_empty());
        assert_eq!(summary.total_count(), 2);
    }

    #[test]
    fn test_dir_deleted_drops_created_children() {
        let db = ModifiedPathsDatabase::new();
        db.dir_created("build");
        db.file_created("build/out.o");
        db.file_created("buildlog.txt");
        db.dir_deleted("build");

        let summary: ModificationSummary = db.get_summary();
        assert!(summary.created_dirs.is_empty());
        assert!(summary.deleted_dirs.is_empty());
        assert_eq!(summary.created_files, vec!["buildlog.txt".to_string()]);
    }

    #[test]
    fn test_dir_renamed() {
        let db = ModifiedPathsDatabase::new();
        db.dir_renamed("src", "lib");

        let summary: ModificationSummary = db.get_summary();
        assert_eq!(summary.deleted_dirs, vec!["src".to_string()]);
        assert_eq!(summary.created_dirs, vec!["lib".to_string()]);
    }

    #[test]
    fn test_clear() {
        let db = ModifiedPathsDatabase::new();
        db.file_created("a");
        db.dir_deleted("b");
        db.clear();
        assert!(!db.has_modifications());
    }
}
