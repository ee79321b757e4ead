//! Path-State Store: durable mapping from path to [`PathEntry`].
//!
//! All mutation goes through compare-and-set, remove and rename. Each
//! mutation is journaled before it is applied, under the same write lock,
//! so the journal order matches the in-memory order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::journal::{Journal, JournalRecord};
use crate::overlay::DirectoryOverlays;
use crate::path::VirtualPath;
use crate::state::{PathEntry, PathState};
use crate::VfsError;

/// Injectable state store contract.
pub trait StateStore: Send + Sync {
    /// Current entry for a path.
    fn get(&self, path: &VirtualPath) -> Option<PathEntry>;

    /// Replace the entry only if its current state is `expected`.
    ///
    /// # Arguments
    /// * `path` - Target path
    /// * `expected` - State the caller read (`PathState::None` for absent)
    /// * `new_entry` - Replacement, or None to remove the entry
    ///
    /// # Returns
    /// `Ok(false)` when the current state differs (lost race).
    fn compare_and_set(
        &self,
        path: &VirtualPath,
        expected: PathState,
        new_entry: Option<PathEntry>,
    ) -> Result<bool, VfsError>;

    /// Remove an entry.
    ///
    /// # Returns
    /// The removed entry, if there was one.
    fn remove(&self, path: &VirtualPath) -> Result<Option<PathEntry>, VfsError>;

    /// Move an entry and every entry beneath it.
    ///
    /// # Arguments
    /// * `from` - Source path
    /// * `to` - Destination path
    /// * `allow_overwrite` - Replace an existing destination file
    ///
    /// # Returns
    /// `PathNotFound` if the source has no entry, `DestinationExists` if the
    /// destination has one and overwrite is not allowed.
    fn rename(&self, from: &VirtualPath, to: &VirtualPath, allow_overwrite: bool)
        -> Result<(), VfsError>;

    /// Entries whose parent is `dir`.
    fn children(&self, dir: &VirtualPath) -> Vec<PathEntry>;

    /// All entries.
    fn entries(&self) -> Vec<PathEntry>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash-map state store with optional journal persistence.
pub struct PathStateStore {
    /// Entries by path key.
    entries: RwLock<HashMap<String, PathEntry>>,
    /// Persistence, if any.
    journal: Option<Arc<Journal>>,
}

impl PathStateStore {
    /// Create an in-memory store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// Create a journaled store from replayed records.
    ///
    /// # Arguments
    /// * `journal` - Journal to append to
    /// * `records` - Records replayed at startup; overlay records are skipped
    pub fn with_journal(journal: Arc<Journal>, records: &[JournalRecord]) -> Self {
        let mut entries: HashMap<String, PathEntry> = HashMap::new();
        for record in records {
            apply_record(&mut entries, record);
        }
        tracing::debug!("Replayed {} path entries", entries.len());
        Self {
            entries: RwLock::new(entries),
            journal: Some(journal),
        }
    }

    /// Run `f` over the records while mutations are held off.
    ///
    /// Mutators journal under the entries write lock, so nothing can be
    /// appended between the snapshot and the end of `f`.
    pub fn with_records<R>(&self, f: impl FnOnce(Vec<JournalRecord>) -> R) -> R {
        let entries = self.entries.read();
        f(entry_records(&entries))
    }

    fn commit(
        &self,
        entries: &mut HashMap<String, PathEntry>,
        records: Vec<JournalRecord>,
    ) -> Result<(), VfsError> {
        if let Some(journal) = &self.journal {
            for record in &records {
                journal.append(record)?;
            }
        }
        for record in &records {
            apply_record(entries, record);
        }
        Ok(())
    }
}

impl Default for PathStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for PathStateStore {
    fn get(&self, path: &VirtualPath) -> Option<PathEntry> {
        self.entries.read().get(path.key()).cloned()
    }

    fn compare_and_set(
        &self,
        path: &VirtualPath,
        expected: PathState,
        new_entry: Option<PathEntry>,
    ) -> Result<bool, VfsError> {
        let mut entries = self.entries.write();
        let current: PathState = entries
            .get(path.key())
            .map(|e| e.state)
            .unwrap_or(PathState::None);
        if current != expected {
            tracing::debug!(
                "CAS lost on {}: expected {:?}, found {:?}",
                path,
                expected,
                current
            );
            return Ok(false);
        }

        let record: JournalRecord = match new_entry {
            Some(entry) if entry.state != PathState::None => JournalRecord::SetEntry {
                entry: entry.with_path(path.clone()),
            },
            _ => JournalRecord::RemoveEntry { path: path.clone() },
        };
        self.commit(&mut entries, vec![record])?;
        Ok(true)
    }

    fn remove(&self, path: &VirtualPath) -> Result<Option<PathEntry>, VfsError> {
        let mut entries = self.entries.write();
        let existing: Option<PathEntry> = entries.get(path.key()).cloned();
        if existing.is_some() {
            self.commit(
                &mut entries,
                vec![JournalRecord::RemoveEntry { path: path.clone() }],
            )?;
        }
        Ok(existing)
    }

    fn rename(
        &self,
        from: &VirtualPath,
        to: &VirtualPath,
        allow_overwrite: bool,
    ) -> Result<(), VfsError> {
        let mut entries = self.entries.write();

        let source: &PathEntry = entries
            .get(from.key())
            .ok_or_else(|| VfsError::PathNotFound(from.to_string()))?;
        if source.is_directory && to.starts_with(from) && to != from {
            return Err(VfsError::InvalidPath(format!(
                "cannot move {} beneath itself",
                from
            )));
        }

        let mut records: Vec<JournalRecord> = Vec::with_capacity(2);
        if let Some(existing) = entries.get(to.key()) {
            if to != from {
                if !allow_overwrite {
                    return Err(VfsError::DestinationExists(to.to_string()));
                }
                if existing.is_directory {
                    return Err(VfsError::AccessDenied(format!(
                        "cannot replace directory {}",
                        to
                    )));
                }
                records.push(JournalRecord::RemoveEntry { path: to.clone() });
            }
        }
        records.push(JournalRecord::RenameEntry {
            from: from.clone(),
            to: to.clone(),
        });

        self.commit(&mut entries, records)?;
        tracing::debug!("Renamed entry {} -> {}", from, to);
        Ok(())
    }

    fn children(&self, dir: &VirtualPath) -> Vec<PathEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.path.parent().as_ref() == Some(dir))
            .cloned()
            .collect()
    }

    fn entries(&self) -> Vec<PathEntry> {
        self.entries.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn entry_records(entries: &HashMap<String, PathEntry>) -> Vec<JournalRecord> {
    let mut entries: Vec<PathEntry> = entries.values().cloned().collect();
    entries.sort_by_key(|e| e.path.depth());
    entries
        .into_iter()
        .map(|entry| JournalRecord::SetEntry { entry })
        .collect()
}

fn apply_record(entries: &mut HashMap<String, PathEntry>, record: &JournalRecord) {
    match record {
        JournalRecord::SetEntry { entry } => {
            entries.insert(entry.path.key().to_string(), entry.clone());
        }
        JournalRecord::RemoveEntry { path } => {
            entries.remove(path.key());
        }
        JournalRecord::RenameEntry { from, to } => {
            let moving: Vec<String> = entries
                .values()
                .filter(|e| e.path.starts_with(from))
                .map(|e| e.path.key().to_string())
                .collect();
            let mut moved: Vec<PathEntry> = Vec::with_capacity(moving.len());
            for key in moving {
                if let Some(entry) = entries.remove(&key) {
                    if let Some(new_path) = entry.path.rebase(from, to) {
                        moved.push(entry.with_path(new_path));
                    }
                }
            }
            for entry in moved {
                entries.insert(entry.path.key().to_string(), entry);
            }
        }
        _ => {}
    }
}

/// Persistent state opened from a state directory.
pub struct PersistentState {
    /// Shared journal.
    pub journal: Arc<Journal>,
    /// Path entries.
    pub store: Arc<PathStateStore>,
    /// Directory overlays.
    pub overlays: Arc<DirectoryOverlays>,
}

impl PersistentState {
    /// Open (or create) the journal and replay it.
    ///
    /// # Arguments
    /// * `state_dir` - Directory holding `state.journal`
    pub fn open(state_dir: &Path) -> Result<Self, VfsError> {
        let (journal, records) = Journal::open(state_dir)?;
        let journal: Arc<Journal> = Arc::new(journal);
        let store = Arc::new(PathStateStore::with_journal(journal.clone(), &records));
        let overlays = Arc::new(DirectoryOverlays::with_journal(journal.clone(), &records));
        tracing::info!(
            "Loaded state from {}: {} entries, {} overlays",
            state_dir.display(),
            store.len(),
            overlays.len()
        );
        Ok(Self {
            journal,
            store,
            overlays,
        })
    }

    /// Rewrite the journal from the live state.
    ///
    /// Store and overlay mutations wait until the rewrite finishes, so no
    /// record lands in the replaced file.
    pub fn compact(&self) -> Result<(), VfsError> {
        self.store.with_records(|mut records| {
            self.overlays.with_records(|overlay_records| {
                records.extend(overlay_records);
                self.journal.compact(&records)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ContentId, PlaceholderVersion};
    use tempfile::TempDir;

    fn p(path: &str) -> VirtualPath {
        VirtualPath::new(path).unwrap()
    }

    fn version() -> PlaceholderVersion {
        PlaceholderVersion::new(4, ContentId::new([9u8; 20]))
    }

    #[test]
    fn test_cas_from_none() {
        let store = PathStateStore::new();
        let entry = PathEntry::virtual_entry(p("a.txt"), false);

        assert!(store
            .compare_and_set(&p("a.txt"), PathState::None, Some(entry.clone()))
            .unwrap());
        assert!(!store
            .compare_and_set(&p("a.txt"), PathState::None, Some(entry))
            .unwrap());
        assert_eq!(store.get(&p("A.TXT")).unwrap().state, PathState::Virtual);
    }

    #[test]
    fn test_cas_to_none_removes() {
        let store = PathStateStore::new();
        let entry = PathEntry::local(p("a"), false);
        store
            .compare_and_set(&p("a"), PathState::None, Some(entry))
            .unwrap();

        assert!(store
            .compare_and_set(&p("a"), PathState::Local, None)
            .unwrap());
        assert!(store.get(&p("a")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_rename_preserves_identity() {
        let store = PathStateStore::new();
        let entry = PathEntry::placeholder(p("a"), false, &version());
        store
            .compare_and_set(&p("a"), PathState::None, Some(entry))
            .unwrap();

        store.rename(&p("a"), &p("b"), false).unwrap();

        assert!(store.get(&p("a")).is_none());
        let moved: PathEntry = store.get(&p("b")).unwrap();
        assert_eq!(moved.state, PathState::Placeholder);
        assert_eq!(moved.version().unwrap(), Some(version()));
    }

    #[test]
    fn test_rename_errors() {
        let store = PathStateStore::new();
        for name in ["a", "b"] {
            store
                .compare_and_set(&p(name), PathState::None, Some(PathEntry::local(p(name), false)))
                .unwrap();
        }

        assert!(matches!(
            store.rename(&p("missing"), &p("c"), false),
            Err(VfsError::PathNotFound(_))
        ));
        assert!(matches!(
            store.rename(&p("a"), &p("b"), false),
            Err(VfsError::DestinationExists(_))
        ));

        store.rename(&p("a"), &p("b"), true).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let store = PathStateStore::new();
        for (path, is_dir) in [("d", true), ("d/x", false), ("d/sub", true), ("d/sub/y", false)] {
            store
                .compare_and_set(&p(path), PathState::None, Some(PathEntry::local(p(path), is_dir)))
                .unwrap();
        }

        store.rename(&p("d"), &p("e"), false).unwrap();

        let mut keys: Vec<String> = store
            .entries()
            .into_iter()
            .map(|e| e.path.as_str().to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["e", "e/sub", "e/sub/y", "e/x"]);
        assert_eq!(store.children(&p("e")).len(), 2);

        assert!(matches!(
            store.rename(&p("e"), &p("e/sub/inner"), false),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let state = PersistentState::open(dir.path()).unwrap();
            let entry = PathEntry::placeholder(p("a"), false, &version());
            state
                .store
                .compare_and_set(&p("a"), PathState::None, Some(entry))
                .unwrap();
            state
                .store
                .compare_and_set(&p("b"), PathState::None, Some(PathEntry::local(p("b"), false)))
                .unwrap();
            state.store.rename(&p("a"), &p("c"), false).unwrap();
            state.store.remove(&p("b")).unwrap();
            state.overlays.record_deleted(&VirtualPath::root(), "a").unwrap();
        }

        let state = PersistentState::open(dir.path()).unwrap();
        assert_eq!(state.store.len(), 1);
        assert_eq!(
            state.store.get(&p("c")).unwrap().version().unwrap(),
            Some(version())
        );
        assert!(state
            .overlays
            .get(&VirtualPath::root())
            .unwrap()
            .is_deleted("a"));
    }

    #[test]
    fn test_compact_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let state = PersistentState::open(dir.path()).unwrap();
            for i in 0..10 {
                let path: VirtualPath = p(&format!("f{}", i));
                state
                    .store
                    .compare_and_set(&path, PathState::None, Some(PathEntry::local(path.clone(), false)))
                    .unwrap();
                state.store.remove(&path).unwrap();
            }
            state
                .store
                .compare_and_set(&p("kept"), PathState::None, Some(PathEntry::local(p("kept"), false)))
                .unwrap();
            state.compact().unwrap();
        }

        let text: String =
            std::fs::read_to_string(dir.path().join(crate::journal::JOURNAL_FILE_NAME)).unwrap();
        assert_eq!(text.lines().count(), 2);

        let state = PersistentState::open(dir.path()).unwrap();
        assert!(state.store.get(&p("kept")).is_some());
    }

    #[test]
    fn test_compact_during_mutations_keeps_every_record() {
        let dir = TempDir::new().unwrap();
        {
            let state = Arc::new(PersistentState::open(dir.path()).unwrap());
            let writers: Vec<std::thread::JoinHandle<()>> = (0..4)
                .map(|t| {
                    let state = state.clone();
                    std::thread::spawn(move || {
                        for i in 0..50 {
                            let path: VirtualPath = p(&format!("t{}/f{}", t, i));
                            state
                                .store
                                .compare_and_set(
                                    &path,
                                    PathState::None,
                                    Some(PathEntry::local(path.clone(), false)),
                                )
                                .unwrap();
                            state
                                .overlays
                                .record_created(&p(&format!("t{}", t)), &format!("f{}", i), false, 0)
                                .unwrap();
                        }
                    })
                })
                .collect();
            for _ in 0..20 {
                state.compact().unwrap();
            }
            for writer in writers {
                writer.join().unwrap();
            }
        }

        let state = PersistentState::open(dir.path()).unwrap();
        assert_eq!(state.store.len(), 200);
        for t in 0..4 {
            let overlay = state.overlays.get(&p(&format!("t{}", t))).unwrap();
            assert_eq!(overlay.created().count(), 50);
        }
    }

    #[test]
    fn test_corrupt_record_only_affects_its_path() {
        let dir = TempDir::new().unwrap();
        {
            let state = PersistentState::open(dir.path()).unwrap();
            let mut bad = PathEntry::placeholder(p("bad"), false, &version());
            bad.reparse = Some(crate::metadata::ReparseRecord::from_raw(vec![1, 2]));
            state
                .store
                .compare_and_set(&p("bad"), PathState::None, Some(bad))
                .unwrap();
            state
                .store
                .compare_and_set(
                    &p("good"),
                    PathState::None,
                    Some(PathEntry::placeholder(p("good"), false, &version())),
                )
                .unwrap();
        }

        let state = PersistentState::open(dir.path()).unwrap();
        assert!(state.store.get(&p("bad")).unwrap().version().is_err());
        assert!(state.store.get(&p("good")).unwrap().version().is_ok());
    }
}
