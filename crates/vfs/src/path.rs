//! Normalized paths relative to the virtualization root.
//!
//! Paths keep the caller's casing for display but compare and hash through
//! a lowercase, forward-slash key, so `Dir\File.txt` and `dir/file.TXT`
//! address the same entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::VfsError;

/// Case-preserving path relative to the virtualization root.
///
/// The empty path is the root itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath {
    /// Path as given, with separators normalized to `/`.
    display: String,
    /// Lowercase lookup key.
    key: String,
}

impl VirtualPath {
    /// The virtualization root.
    pub fn root() -> Self {
        Self {
            display: String::new(),
            key: String::new(),
        }
    }

    /// Parse and normalize a relative path.
    ///
    /// Backslashes become `/`, empty and `.` components are dropped.
    ///
    /// # Arguments
    /// * `path` - Relative path as received from the caller
    ///
    /// # Returns
    /// Normalized path, or `InvalidPath` for `..` components or NUL bytes.
    pub fn new(path: &str) -> Result<Self, VfsError> {
        let mut parts: Vec<&str> = Vec::new();
        for component in path.split(|c: char| c == '/' || c == '\\') {
            match component {
                "" | "." => continue,
                ".." => return Err(VfsError::InvalidPath(path.to_string())),
                c if c.contains('\0') => return Err(VfsError::InvalidPath(path.to_string())),
                c => parts.push(c),
            }
        }

        let display: String = parts.join("/");
        let key: String = display.to_lowercase();
        Ok(Self { display, key })
    }

    /// Lowercase lookup key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Case-preserving form.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Check if this is the root.
    pub fn is_root(&self) -> bool {
        self.display.is_empty()
    }

    /// Final component, or "" for the root.
    pub fn name(&self) -> &str {
        self.display
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.display)
    }

    /// Parent directory, or None for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        match self.display.rsplit_once('/') {
            Some((parent, _)) => Some(Self {
                display: parent.to_string(),
                key: parent.to_lowercase(),
            }),
            None => Some(Self::root()),
        }
    }

    /// Append a single child name.
    ///
    /// # Arguments
    /// * `name` - Child name (must not contain separators)
    pub fn join(&self, name: &str) -> VirtualPath {
        let display: String = if self.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", self.display, name)
        };
        let key: String = display.to_lowercase();
        Self { display, key }
    }

    /// Number of components (root is 0).
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.display.matches('/').count() + 1
        }
    }

    /// Ancestors from the root down to (excluding) this path.
    pub fn ancestors(&self) -> Vec<VirtualPath> {
        let mut result: Vec<VirtualPath> = Vec::with_capacity(self.depth());
        let mut current: Option<VirtualPath> = self.parent();
        while let Some(path) = current {
            current = path.parent();
            result.push(path);
        }
        result.reverse();
        result
    }

    /// Check whether `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        other.is_root()
            || self.key == other.key
            || (self.key.starts_with(&other.key)
                && self.key.as_bytes().get(other.key.len()) == Some(&b'/'))
    }

    /// Re-root a path from beneath `from` to beneath `to`.
    ///
    /// # Returns
    /// The moved path, or None if `self` is not under `from`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        if !self.starts_with(from) {
            return None;
        }
        let moved: VirtualPath = self
            .display
            .split('/')
            .filter(|c| !c.is_empty())
            .skip(from.depth())
            .fold(to.clone(), |acc, component| acc.join(component));
        Some(moved)
    }
}

impl PartialEq for VirtualPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for VirtualPath {}

impl std::hash::Hash for VirtualPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.display)
        }
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = VfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<VirtualPath> for String {
    fn from(value: VirtualPath) -> Self {
        value.display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_separators() {
        let path = VirtualPath::new("Dir\\Sub/File.txt").unwrap();
        assert_eq!(path.as_str(), "Dir/Sub/File.txt");
        assert_eq!(path.key(), "dir/sub/file.txt");
    }

    #[test]
    fn test_case_insensitive_equality() {
        let a = VirtualPath::new("Dir/File.TXT").unwrap();
        let b = VirtualPath::new("dir\\file.txt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_drops_empty_components() {
        let path = VirtualPath::new("/a//./b/").unwrap();
        assert_eq!(path.as_str(), "a/b");
    }

    #[test]
    fn test_rejects_parent_components() {
        assert!(matches!(
            VirtualPath::new("a/../b"),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parent_and_name() {
        let path = VirtualPath::new("a/b/c.txt").unwrap();
        assert_eq!(path.name(), "c.txt");
        assert_eq!(path.parent().unwrap().as_str(), "a/b");

        let top = VirtualPath::new("top").unwrap();
        assert!(top.parent().unwrap().is_root());
        assert!(VirtualPath::root().parent().is_none());
    }

    #[test]
    fn test_join_and_depth() {
        let root = VirtualPath::root();
        assert_eq!(root.depth(), 0);

        let child = root.join("a").join("B");
        assert_eq!(child.as_str(), "a/B");
        assert_eq!(child.depth(), 2);
    }

    #[test]
    fn test_ancestors() {
        let path = VirtualPath::new("a/b/c").unwrap();
        let ancestors: Vec<String> = path
            .ancestors()
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        assert_eq!(ancestors, vec!["", "a", "a/b"]);
    }

    #[test]
    fn test_starts_with() {
        let path = VirtualPath::new("dir/sub/file").unwrap();
        assert!(path.starts_with(&VirtualPath::new("DIR").unwrap()));
        assert!(path.starts_with(&VirtualPath::root()));
        assert!(!path.starts_with(&VirtualPath::new("di").unwrap()));
        assert!(!VirtualPath::new("dirx/file")
            .unwrap()
            .starts_with(&VirtualPath::new("dir").unwrap()));
    }

    #[test]
    fn test_rebase() {
        let from = VirtualPath::new("Old").unwrap();
        let to = VirtualPath::new("new/place").unwrap();

        let moved = VirtualPath::new("old/Sub/File.txt")
            .unwrap()
            .rebase(&from, &to)
            .unwrap();
        assert_eq!(moved.as_str(), "new/place/Sub/File.txt");

        assert_eq!(from.rebase(&from, &to).unwrap().as_str(), "new/place");
        assert!(VirtualPath::new("other").unwrap().rebase(&from, &to).is_none());
    }
}
