//! Per-path virtualization state machine.
//!
//! The lifecycle is a closed set of states and transitions are a pure
//! function of `(current state, transition, is_directory)`:
//!
//! ```text
//!  None ──discover──► Virtual ──open──► Placeholder ──materialize──► Full
//!   │                    │                  │                          │
//!   └──create──► Local   └──────────────────┴───── delete ─────────────┴──► None
//! ```

use serde::{Deserialize, Serialize};

use crate::metadata::{PlaceholderVersion, ReparseRecord};
use crate::path::VirtualPath;
use crate::VfsError;

/// Virtualization state of a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathState {
    /// No entry exists.
    None,
    /// Known to the backing store, nothing on disk yet.
    Virtual,
    /// Identity metadata written locally, content not fetched.
    Placeholder,
    /// Content fully materialized locally.
    Full,
    /// Created locally with no backing counterpart.
    Local,
}

impl PathState {
    /// Whether entries in this state carry epoch and content id.
    pub fn has_identity(self) -> bool {
        matches!(self, PathState::Placeholder | PathState::Full)
    }

    /// Whether the path is visible to callers.
    pub fn exists(self) -> bool {
        self != PathState::None
    }
}

/// Operations that move a path between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Enumeration or lookup found the path in the backing store.
    Discover,
    /// Open wrote reparse metadata locally.
    CreatePlaceholder,
    /// Content fetched and written locally.
    Materialize,
    /// Placeholder identity replaced after a stale epoch.
    Refresh,
    /// Delete confirmed at handle close.
    Delete,
    /// Rename within the managed tree.
    Rename,
    /// Path created locally (also the inbound half of a boundary move).
    CreateLocal,
}

/// Compute the state after applying a transition.
///
/// # Arguments
/// * `current` - Current state of the path
/// * `transition` - Requested transition
/// * `is_directory` - Whether the path is a directory
///
/// # Returns
/// Resulting state, or the error the caller should surface when the
/// transition is not legal from `current`.
pub fn next_state(
    current: PathState,
    transition: Transition,
    is_directory: bool,
) -> Result<PathState, VfsError> {
    use PathState as S;
    use Transition as T;

    let illegal = || {
        VfsError::AccessDenied(format!(
            "transition {:?} is not legal from {:?}",
            transition, current
        ))
    };

    match (transition, current) {
        (T::Discover, S::None) => Ok(S::Virtual),
        (T::Discover, _) => Err(VfsError::LostRace(format!(
            "discover found existing {:?} entry",
            current
        ))),

        (T::CreatePlaceholder, S::Virtual) => Ok(S::Placeholder),
        (T::CreatePlaceholder, S::None) => Err(VfsError::PathNotFound(
            "placeholder requested for missing path".to_string(),
        )),
        (T::CreatePlaceholder, _) => Err(illegal()),

        (T::Materialize, _) if is_directory => Err(VfsError::IsADirectory(
            "directories cannot be materialized".to_string(),
        )),
        (T::Materialize, S::Placeholder) | (T::Materialize, S::Full) => Ok(S::Full),
        (T::Materialize, S::None) => Err(VfsError::PathNotFound(
            "materialize requested for missing path".to_string(),
        )),
        (T::Materialize, _) => Err(illegal()),

        (T::Refresh, S::Placeholder) => Ok(S::Placeholder),
        (T::Refresh, _) => Err(illegal()),

        (T::Delete, S::None) | (T::Rename, S::None) => Err(VfsError::PathNotFound(
            "no entry for path".to_string(),
        )),
        (T::Delete, _) => Ok(S::None),
        (T::Rename, state) => Ok(state),

        (T::CreateLocal, S::None) => Ok(S::Local),
        (T::CreateLocal, _) => Err(VfsError::DestinationExists(
            "path already has an entry".to_string(),
        )),
    }
}

/// State-store record for one managed path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Case-preserving path relative to the root.
    pub path: VirtualPath,
    /// Current state.
    pub state: PathState,
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// Reparse metadata, present only for `Placeholder` and `Full`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reparse: Option<ReparseRecord>,
}

impl PathEntry {
    /// Entry for a path discovered in the backing store.
    pub fn virtual_entry(path: VirtualPath, is_directory: bool) -> Self {
        Self {
            path,
            state: PathState::Virtual,
            is_directory,
            reparse: None,
        }
    }

    /// Entry for a placeholder with identity metadata.
    pub fn placeholder(path: VirtualPath, is_directory: bool, version: &PlaceholderVersion) -> Self {
        Self {
            path,
            state: PathState::Placeholder,
            is_directory,
            reparse: Some(ReparseRecord::from_version(version)),
        }
    }

    /// Entry for a locally created path.
    pub fn local(path: VirtualPath, is_directory: bool) -> Self {
        Self {
            path,
            state: PathState::Local,
            is_directory,
            reparse: None,
        }
    }

    /// Copy of this entry moved to another state.
    ///
    /// Reparse metadata is dropped for states without identity.
    pub fn with_state(&self, state: PathState) -> Self {
        Self {
            path: self.path.clone(),
            state,
            is_directory: self.is_directory,
            reparse: if state.has_identity() {
                self.reparse.clone()
            } else {
                None
            },
        }
    }

    /// Copy of this entry at another path.
    pub fn with_path(&self, path: VirtualPath) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }

    /// Decode the placeholder identity.
    ///
    /// # Returns
    /// `None` for states without identity; an error if a required record is
    /// missing or corrupt.
    pub fn version(&self) -> Result<Option<PlaceholderVersion>, VfsError> {
        if !self.state.has_identity() {
            return Ok(None);
        }
        match &self.reparse {
            Some(record) => record.version().map(Some),
            None => Err(VfsError::MalformedMetadata(format!(
                "{} has no reparse record",
                self.path
            ))),
        }
    }

    /// Decode the placeholder identity, requiring one to exist.
    pub fn require_version(&self) -> Result<PlaceholderVersion, VfsError> {
        self.version()?.ok_or_else(|| {
            VfsError::AccessDenied(format!("{} is {:?} and has no identity", self.path, self.state))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ContentId;

    const ALL_STATES: [PathState; 5] = [
        PathState::None,
        PathState::Virtual,
        PathState::Placeholder,
        PathState::Full,
        PathState::Local,
    ];

    fn version() -> PlaceholderVersion {
        PlaceholderVersion::new(1, ContentId::new([7u8; 20]))
    }

    /// Expected result for files, one row per transition, one column per state
    /// in `ALL_STATES` order. `None` marks an illegal transition.
    fn file_table() -> Vec<(Transition, [Option<PathState>; 5])> {
        use PathState as S;
        const X: Option<PathState> = Option::None;
        let gone: Option<PathState> = Some(S::None);
        vec![
            (Transition::Discover, [Some(S::Virtual), X, X, X, X]),
            (Transition::CreatePlaceholder, [X, Some(S::Placeholder), X, X, X]),
            (Transition::Materialize, [X, X, Some(S::Full), Some(S::Full), X]),
            (Transition::Refresh, [X, X, Some(S::Placeholder), X, X]),
            (Transition::Delete, [X, gone, gone, gone, gone]),
            (
                Transition::Rename,
                [X, Some(S::Virtual), Some(S::Placeholder), Some(S::Full), Some(S::Local)],
            ),
            (Transition::CreateLocal, [Some(S::Local), X, X, X, X]),
        ]
    }

    #[test]
    fn test_file_transition_table() {
        for (transition, expected) in file_table() {
            for (state, want) in ALL_STATES.iter().zip(expected.iter()) {
                let got: Result<PathState, VfsError> = next_state(*state, transition, false);
                match want {
                    Some(s) => assert_eq!(
                        got.unwrap(),
                        *s,
                        "{:?} from {:?}",
                        transition,
                        state
                    ),
                    None => assert!(got.is_err(), "{:?} from {:?} should fail", transition, state),
                }
            }
        }
    }

    #[test]
    fn test_directories_never_become_full() {
        for state in ALL_STATES {
            assert!(next_state(state, Transition::Materialize, true).is_err());
        }
    }

    #[test]
    fn test_directory_delete_and_rename_match_files() {
        for state in ALL_STATES {
            for transition in [Transition::Delete, Transition::Rename] {
                assert_eq!(
                    next_state(state, transition, true).ok(),
                    next_state(state, transition, false).ok()
                );
            }
        }
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            next_state(PathState::None, Transition::Delete, false),
            Err(VfsError::PathNotFound(_))
        ));
        assert!(matches!(
            next_state(PathState::Local, Transition::CreateLocal, false),
            Err(VfsError::DestinationExists(_))
        ));
        assert!(matches!(
            next_state(PathState::Virtual, Transition::Discover, false),
            Err(VfsError::LostRace(_))
        ));
    }

    #[test]
    fn test_identity_only_with_placeholder_or_full() {
        let path = VirtualPath::new("a.txt").unwrap();
        let placeholder = PathEntry::placeholder(path, false, &version());
        assert_eq!(placeholder.version().unwrap(), Some(version()));

        let full = placeholder.with_state(PathState::Full);
        assert_eq!(full.version().unwrap(), Some(version()));

        let deleted = full.with_state(PathState::None);
        assert!(deleted.reparse.is_none());
        assert_eq!(deleted.version().unwrap(), None);

        let local = PathEntry::local(VirtualPath::new("b.txt").unwrap(), false);
        assert_eq!(local.version().unwrap(), None);
        assert!(local.require_version().is_err());
    }

    #[test]
    fn test_missing_record_is_malformed() {
        let mut entry = PathEntry::placeholder(VirtualPath::new("a").unwrap(), false, &version());
        entry.reparse = None;
        assert!(matches!(
            entry.version(),
            Err(VfsError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_with_path_preserves_identity() {
        let entry = PathEntry::placeholder(VirtualPath::new("a").unwrap(), false, &version());
        let moved = entry.with_path(VirtualPath::new("dir/b").unwrap());
        assert_eq!(moved.path.as_str(), "dir/b");
        assert_eq!(moved.version().unwrap(), Some(version()));
    }
}
