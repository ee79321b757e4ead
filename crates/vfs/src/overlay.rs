//! Per-directory overlays of local changes not yet reconciled with the
//! backing listing.
//!
//! A directory's visible children are the backing listing minus `deleted`
//! names, plus `created` names (which win over a backing entry of the same
//! name). An expanded directory ignores the backing listing entirely; this
//! is how a directory keeps its children after being renamed away from the
//! backing path they were listed under.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::journal::{Journal, JournalRecord};
use crate::path::VirtualPath;
use crate::VfsError;

/// A child created locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayChild {
    /// Child name (case preserved).
    pub name: String,
    /// Whether the child is a directory.
    pub is_directory: bool,
    /// Size reported in listings.
    pub size: u64,
}

/// Local changes for one directory.
#[derive(Clone, Debug)]
pub struct DirectoryOverlay {
    /// Directory path.
    dir: VirtualPath,
    /// Created children by lowercase name.
    created: HashMap<String, OverlayChild>,
    /// Deleted backing children by lowercase name (value keeps casing).
    deleted: HashMap<String, String>,
    /// Whether the backing listing is ignored.
    expanded: bool,
}

impl DirectoryOverlay {
    fn new(dir: VirtualPath) -> Self {
        Self {
            dir,
            created: HashMap::new(),
            deleted: HashMap::new(),
            expanded: false,
        }
    }

    /// Directory this overlay belongs to.
    pub fn dir(&self) -> &VirtualPath {
        &self.dir
    }

    /// Children created locally.
    pub fn created(&self) -> impl Iterator<Item = &OverlayChild> {
        self.created.values()
    }

    /// Look up a created child.
    pub fn created_child(&self, name: &str) -> Option<&OverlayChild> {
        self.created.get(&name.to_lowercase())
    }

    /// Whether a backing child is suppressed.
    pub fn is_deleted(&self, name: &str) -> bool {
        self.deleted.contains_key(&name.to_lowercase())
    }

    /// Whether the backing listing is ignored.
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && !self.expanded
    }

    fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::OverlayCreated {
                name,
                is_directory,
                size,
                ..
            } => {
                self.created.insert(
                    name.to_lowercase(),
                    OverlayChild {
                        name: name.clone(),
                        is_directory: *is_directory,
                        size: *size,
                    },
                );
            }
            JournalRecord::OverlayDeleted { name, .. } => {
                let key: String = name.to_lowercase();
                self.created.remove(&key);
                self.deleted.insert(key, name.clone());
            }
            JournalRecord::OverlayExpanded { .. } => self.expanded = true,
            _ => {}
        }
    }

    /// Records that rebuild this overlay at `dir`.
    fn records_at(&self, dir: &VirtualPath) -> Vec<JournalRecord> {
        let mut records: Vec<JournalRecord> = Vec::new();
        if self.expanded {
            records.push(JournalRecord::OverlayExpanded { dir: dir.clone() });
        }
        for name in self.deleted.values() {
            records.push(JournalRecord::OverlayDeleted {
                dir: dir.clone(),
                name: name.clone(),
            });
        }
        for child in self.created.values() {
            records.push(JournalRecord::OverlayCreated {
                dir: dir.clone(),
                name: child.name.clone(),
                is_directory: child.is_directory,
                size: child.size,
            });
        }
        records
    }
}

/// All directory overlays, optionally journaled.
pub struct DirectoryOverlays {
    /// Overlays by directory key.
    overlays: RwLock<HashMap<String, DirectoryOverlay>>,
    /// Persistence, if any.
    journal: Option<Arc<Journal>>,
}

impl DirectoryOverlays {
    /// Create an in-memory overlay set.
    pub fn new() -> Self {
        Self {
            overlays: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// Create a journaled overlay set from replayed records.
    ///
    /// # Arguments
    /// * `journal` - Journal to append to
    /// * `records` - Records replayed at startup; non-overlay records are skipped
    pub fn with_journal(journal: Arc<Journal>, records: &[JournalRecord]) -> Self {
        let mut overlays: HashMap<String, DirectoryOverlay> = HashMap::new();
        for record in records {
            apply_record(&mut overlays, record);
        }
        Self {
            overlays: RwLock::new(overlays),
            journal: Some(journal),
        }
    }

    /// Snapshot of a directory's overlay.
    pub fn get(&self, dir: &VirtualPath) -> Option<DirectoryOverlay> {
        self.overlays.read().get(dir.key()).cloned()
    }

    /// Inspect a directory's overlay in place, without cloning it.
    pub fn with_overlay<R>(
        &self,
        dir: &VirtualPath,
        f: impl FnOnce(Option<&DirectoryOverlay>) -> R,
    ) -> R {
        f(self.overlays.read().get(dir.key()))
    }

    /// Record a locally created child.
    pub fn record_created(
        &self,
        dir: &VirtualPath,
        name: &str,
        is_directory: bool,
        size: u64,
    ) -> Result<(), VfsError> {
        self.commit(vec![JournalRecord::OverlayCreated {
            dir: dir.clone(),
            name: name.to_string(),
            is_directory,
            size,
        }])
    }

    /// Record that a child no longer exists.
    pub fn record_deleted(&self, dir: &VirtualPath, name: &str) -> Result<(), VfsError> {
        self.commit(vec![JournalRecord::OverlayDeleted {
            dir: dir.clone(),
            name: name.to_string(),
        }])
    }

    /// Stop consulting the backing listing for `dir`, pinning `children` as
    /// its explicit contents.
    pub fn expand(&self, dir: &VirtualPath, children: Vec<OverlayChild>) -> Result<(), VfsError> {
        let mut records: Vec<JournalRecord> =
            vec![JournalRecord::OverlayExpanded { dir: dir.clone() }];
        records.extend(children.into_iter().map(|child| JournalRecord::OverlayCreated {
            dir: dir.clone(),
            name: child.name,
            is_directory: child.is_directory,
            size: child.size,
        }));
        self.commit(records)
    }

    /// Drop the overlays of `dir` and every directory beneath it.
    pub fn forget_subtree(&self, dir: &VirtualPath) -> Result<(), VfsError> {
        let dirs: Vec<VirtualPath> = self.subtree_dirs(dir);
        self.commit(
            dirs.into_iter()
                .map(|d| JournalRecord::OverlayForget { dir: d })
                .collect(),
        )
    }

    /// Move the overlays of `from` and every directory beneath it to `to`.
    pub fn move_subtree(&self, from: &VirtualPath, to: &VirtualPath) -> Result<(), VfsError> {
        let moving: Vec<DirectoryOverlay> = {
            let overlays = self.overlays.read();
            overlays
                .values()
                .filter(|o| o.dir.starts_with(from))
                .cloned()
                .collect()
        };

        let mut records: Vec<JournalRecord> = Vec::new();
        for overlay in &moving {
            records.push(JournalRecord::OverlayForget {
                dir: overlay.dir.clone(),
            });
        }
        for overlay in &moving {
            if let Some(new_dir) = overlay.dir.rebase(from, to) {
                records.extend(overlay.records_at(&new_dir));
            }
        }
        self.commit(records)
    }

    /// Run `f` over the records while overlay mutations are held off.
    pub fn with_records<R>(&self, f: impl FnOnce(Vec<JournalRecord>) -> R) -> R {
        let overlays = self.overlays.read();
        f(overlay_records(&overlays))
    }

    /// Number of directories with overlay state.
    pub fn len(&self) -> usize {
        self.overlays.read().len()
    }

    /// Check if no directory has overlay state.
    pub fn is_empty(&self) -> bool {
        self.overlays.read().is_empty()
    }

    fn subtree_dirs(&self, dir: &VirtualPath) -> Vec<VirtualPath> {
        self.overlays
            .read()
            .values()
            .filter(|o| o.dir.starts_with(dir))
            .map(|o| o.dir.clone())
            .collect()
    }

    /// Journal then apply records under the write lock.
    fn commit(&self, records: Vec<JournalRecord>) -> Result<(), VfsError> {
        let mut overlays = self.overlays.write();
        if let Some(journal) = &self.journal {
            for record in &records {
                journal.append(record)?;
            }
        }
        for record in &records {
            apply_record(&mut overlays, record);
        }
        Ok(())
    }
}

impl Default for DirectoryOverlays {
    fn default() -> Self {
        Self::new()
    }
}

fn overlay_records(overlays: &HashMap<String, DirectoryOverlay>) -> Vec<JournalRecord> {
    overlays
        .values()
        .flat_map(|o| o.records_at(&o.dir))
        .collect()
}

fn apply_record(overlays: &mut HashMap<String, DirectoryOverlay>, record: &JournalRecord) {
    let dir: &VirtualPath = match record {
        JournalRecord::OverlayCreated { dir, .. }
        | JournalRecord::OverlayDeleted { dir, .. }
        | JournalRecord::OverlayExpanded { dir } => dir,
        JournalRecord::OverlayForget { dir } => {
            overlays.remove(dir.key());
            return;
        }
        _ => return,
    };

    let overlay: &mut DirectoryOverlay = overlays
        .entry(dir.key().to_string())
        .or_insert_with(|| DirectoryOverlay::new(dir.clone()));
    overlay.apply(record);
    if overlay.is_empty() {
        overlays.remove(dir.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(path: &str) -> VirtualPath {
        VirtualPath::new(path).unwrap()
    }

    #[test]
    fn test_created_and_deleted() {
        let overlays = DirectoryOverlays::new();
        overlays.record_created(&p("dir"), "New.txt", false, 3).unwrap();
        overlays.record_deleted(&p("dir"), "old.txt").unwrap();

        let overlay: DirectoryOverlay = overlays.get(&p("DIR")).unwrap();
        assert_eq!(overlay.created_child("new.TXT").unwrap().name, "New.txt");
        assert!(overlay.is_deleted("OLD.txt"));
        assert!(!overlay.is_expanded());
    }

    #[test]
    fn test_delete_removes_created() {
        let overlays = DirectoryOverlays::new();
        overlays.record_created(&p("dir"), "a", false, 0).unwrap();
        overlays.record_deleted(&p("dir"), "a").unwrap();

        let overlay: DirectoryOverlay = overlays.get(&p("dir")).unwrap();
        assert!(overlay.created_child("a").is_none());
        assert!(overlay.is_deleted("a"));
    }

    #[test]
    fn test_create_over_deleted_backing_name() {
        let overlays = DirectoryOverlays::new();
        overlays.record_deleted(&p("dir"), "a").unwrap();
        overlays.record_created(&p("dir"), "a", true, 0).unwrap();

        let overlay: DirectoryOverlay = overlays.get(&p("dir")).unwrap();
        assert!(overlay.created_child("a").unwrap().is_directory);
        // Deleting the local child again must keep the backing one hidden.
        overlays.record_deleted(&p("dir"), "a").unwrap();
        assert!(overlays.get(&p("dir")).unwrap().is_deleted("a"));
    }

    #[test]
    fn test_move_subtree() {
        let overlays = DirectoryOverlays::new();
        overlays.record_created(&p("src/sub"), "x", false, 0).unwrap();
        overlays
            .expand(
                &p("src"),
                vec![OverlayChild {
                    name: "sub".to_string(),
                    is_directory: true,
                    size: 0,
                }],
            )
            .unwrap();
        overlays.record_created(&p("other"), "y", false, 0).unwrap();

        overlays.move_subtree(&p("src"), &p("dst/moved")).unwrap();

        assert!(overlays.get(&p("src")).is_none());
        assert!(overlays.get(&p("src/sub")).is_none());
        assert!(overlays.get(&p("dst/moved")).unwrap().is_expanded());
        assert!(overlays
            .get(&p("dst/moved/sub"))
            .unwrap()
            .created_child("x")
            .is_some());
        assert!(overlays.get(&p("other")).is_some());
    }

    #[test]
    fn test_forget_subtree() {
        let overlays = DirectoryOverlays::new();
        overlays.record_deleted(&p("a"), "x").unwrap();
        overlays.record_deleted(&p("a/b"), "y").unwrap();
        overlays.forget_subtree(&p("a")).unwrap();
        assert!(overlays.is_empty());
    }

    #[test]
    fn test_journal_replay() {
        let dir = TempDir::new().unwrap();
        {
            let (journal, records) = Journal::open(dir.path()).unwrap();
            let overlays = DirectoryOverlays::with_journal(Arc::new(journal), &records);
            overlays.record_created(&p("d"), "kept", false, 5).unwrap();
            overlays.record_deleted(&p("d"), "gone").unwrap();
            overlays.record_deleted(&p("e"), "x").unwrap();
            overlays.forget_subtree(&p("e")).unwrap();
        }

        let (journal, records) = Journal::open(dir.path()).unwrap();
        let overlays = DirectoryOverlays::with_journal(Arc::new(journal), &records);
        let overlay: DirectoryOverlay = overlays.get(&p("d")).unwrap();
        assert_eq!(overlay.created_child("kept").unwrap().size, 5);
        assert!(overlay.is_deleted("gone"));
        assert!(overlays.get(&p("e")).is_none());
    }
}
