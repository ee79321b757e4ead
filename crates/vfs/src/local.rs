//! Local content layer holding bytes for `Full` and `Local` files.
//!
//! # Directory Structure
//! ```text
//! scratch_root/
//! └── path/to/            # lowercase path keys
//!     ├── file.txt        # full content
//!     └── .tmpXXXXXX      # in-flight atomic write (unique name)
//! ```
//!
//! Files are held whole, so offsets and lengths are capped at
//! [`MAX_FILE_SIZE`].

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::path::VirtualPath;
use crate::VfsError;

/// Storage for locally held file content.
pub trait LocalStore: Send + Sync {
    /// Read up to `len` bytes at `offset`.
    ///
    /// # Returns
    /// Bytes read (short at end of file), `PathNotFound` if no content.
    fn read(&self, path: &VirtualPath, offset: u64, len: usize) -> Result<Vec<u8>, VfsError>;

    /// Replace the whole content of a file.
    fn write_all(&self, path: &VirtualPath, data: &[u8]) -> Result<(), VfsError>;

    /// Write at an offset, zero-filling any gap; creates the file if needed.
    ///
    /// # Returns
    /// Bytes written.
    fn write_at(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize, VfsError>;

    /// Set the file length, zero-extending if needed.
    fn truncate(&self, path: &VirtualPath, len: u64) -> Result<(), VfsError>;

    /// Remove a path's content and anything beneath it. Missing is not an error.
    fn remove(&self, path: &VirtualPath) -> Result<(), VfsError>;

    /// Move content from one path (and beneath it) to another.
    fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<(), VfsError>;

    /// Content size, or None if the path holds no content.
    fn size(&self, path: &VirtualPath) -> Result<Option<u64>, VfsError>;

    /// Copy content to a path outside the managed tree.
    fn export(&self, path: &VirtualPath, dest: &Path) -> Result<(), VfsError>;

    /// Read the whole file.
    fn read_all(&self, path: &VirtualPath) -> Result<Vec<u8>, VfsError> {
        let size: u64 = self
            .size(path)?
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        self.read(path, 0, size as usize)
    }
}

/// Largest file the local layer holds.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Check that `[offset, offset + len)` fits in a local file.
///
/// # Returns
/// The range as buffer indices, or `RangeOutOfBounds`.
fn checked_range(path: &VirtualPath, offset: u64, len: u64) -> Result<(usize, usize), VfsError> {
    let out_of_bounds = || VfsError::RangeOutOfBounds {
        path: path.to_string(),
        offset,
        len,
    };
    let end: u64 = offset.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > MAX_FILE_SIZE {
        return Err(out_of_bounds());
    }
    let start: usize = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end: usize = usize::try_from(end).map_err(|_| out_of_bounds())?;
    Ok((start, end))
}

/// Apply a positional write to an in-memory buffer.
fn splice(
    buffer: &mut Vec<u8>,
    path: &VirtualPath,
    offset: u64,
    data: &[u8],
) -> Result<usize, VfsError> {
    let (start, end) = checked_range(path, offset, data.len() as u64)?;
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    buffer[start..end].copy_from_slice(data);
    Ok(data.len())
}

/// Resize a buffer to a new file length.
fn resize(buffer: &mut Vec<u8>, path: &VirtualPath, len: u64) -> Result<(), VfsError> {
    let (_, end) = checked_range(path, 0, len)?;
    buffer.resize(end, 0);
    Ok(())
}

/// Slice a read out of a buffer.
fn window(buffer: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start: usize = usize::try_from(offset).unwrap_or(usize::MAX).min(buffer.len());
    let end: usize = start.saturating_add(len).min(buffer.len());
    buffer[start..end].to_vec()
}

/// In-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    /// Content by path key.
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files holding content.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Check if no file holds content.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn read(&self, path: &VirtualPath, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let files = self.files.read();
        let data: &Vec<u8> = files
            .get(path.key())
            .ok_or_else(|| VfsError::PathNotFound(path.to_string()))?;
        Ok(window(data, offset, len))
    }

    fn write_all(&self, path: &VirtualPath, data: &[u8]) -> Result<(), VfsError> {
        self.files
            .write()
            .insert(path.key().to_string(), data.to_vec());
        Ok(())
    }

    fn write_at(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        checked_range(path, offset, data.len() as u64)?;
        let mut files = self.files.write();
        let buffer: &mut Vec<u8> = files.entry(path.key().to_string()).or_default();
        splice(buffer, path, offset, data)
    }

    fn truncate(&self, path: &VirtualPath, len: u64) -> Result<(), VfsError> {
        checked_range(path, 0, len)?;
        let mut files = self.files.write();
        let buffer: &mut Vec<u8> = files.entry(path.key().to_string()).or_default();
        resize(buffer, path, len)
    }

    fn remove(&self, path: &VirtualPath) -> Result<(), VfsError> {
        let prefix: String = format!("{}/", path.key());
        self.files
            .write()
            .retain(|key, _| key != path.key() && !key.starts_with(&prefix));
        Ok(())
    }

    fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<(), VfsError> {
        let mut files = self.files.write();
        let moving: Vec<String> = files
            .keys()
            .filter(|key| {
                key.as_str() == from.key() || key.starts_with(&format!("{}/", from.key()))
            })
            .cloned()
            .collect();

        for key in moving {
            if let Some(data) = files.remove(&key) {
                let new_key: String = format!("{}{}", to.key(), &key[from.key().len()..]);
                files.insert(new_key, data);
            }
        }
        Ok(())
    }

    fn size(&self, path: &VirtualPath) -> Result<Option<u64>, VfsError> {
        Ok(self.files.read().get(path.key()).map(|d| d.len() as u64))
    }

    fn export(&self, path: &VirtualPath, dest: &Path) -> Result<(), VfsError> {
        let data: Vec<u8> = self.read_all(path)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, data)?;
        Ok(())
    }
}

/// Local store backed by files under a scratch directory.
pub struct DiskLocalStore {
    /// Root directory for content.
    root: PathBuf,
}

impl DiskLocalStore {
    /// Create a store rooted at `root`, creating it if needed.
    ///
    /// # Arguments
    /// * `root` - Scratch directory
    pub fn new(root: PathBuf) -> Result<Self, VfsError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Scratch root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, path: &VirtualPath) -> PathBuf {
        path.key()
            .split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |acc, c| acc.join(c))
    }

    /// Write a whole file via a uniquely named temp file and rename.
    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), VfsError> {
        let parent: &Path = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;
        let mut temp: NamedTempFile = NamedTempFile::new_in(parent)?;
        temp.write_all(data)?;
        temp.as_file().sync_data()?;
        temp.persist(target).map_err(|e| VfsError::Io(e.error))?;
        Ok(())
    }

    fn read_existing(&self, target: &Path) -> Result<Vec<u8>, VfsError> {
        match std::fs::read(target) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LocalStore for DiskLocalStore {
    fn read(&self, path: &VirtualPath, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let target: PathBuf = self.file_path(path);
        if !target.is_file() {
            return Err(VfsError::PathNotFound(path.to_string()));
        }
        let data: Vec<u8> = std::fs::read(&target)?;
        Ok(window(&data, offset, len))
    }

    fn write_all(&self, path: &VirtualPath, data: &[u8]) -> Result<(), VfsError> {
        self.write_atomic(&self.file_path(path), data)
    }

    fn write_at(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        checked_range(path, offset, data.len() as u64)?;
        let target: PathBuf = self.file_path(path);
        let mut buffer: Vec<u8> = self.read_existing(&target)?;
        let written: usize = splice(&mut buffer, path, offset, data)?;
        self.write_atomic(&target, &buffer)?;
        Ok(written)
    }

    fn truncate(&self, path: &VirtualPath, len: u64) -> Result<(), VfsError> {
        checked_range(path, 0, len)?;
        let target: PathBuf = self.file_path(path);
        let mut buffer: Vec<u8> = self.read_existing(&target)?;
        resize(&mut buffer, path, len)?;
        self.write_atomic(&target, &buffer)
    }

    fn remove(&self, path: &VirtualPath) -> Result<(), VfsError> {
        let target: PathBuf = self.file_path(path);
        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        } else if target.exists() {
            std::fs::remove_file(&target)?;
        }
        Ok(())
    }

    fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<(), VfsError> {
        let source: PathBuf = self.file_path(from);
        if !source.exists() {
            return Ok(());
        }
        let target: PathBuf = self.file_path(to);
        if target.exists() {
            self.remove(to)?;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&source, &target)?;
        Ok(())
    }

    fn size(&self, path: &VirtualPath) -> Result<Option<u64>, VfsError> {
        let target: PathBuf = self.file_path(path);
        match std::fs::metadata(&target) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn export(&self, path: &VirtualPath, dest: &Path) -> Result<(), VfsError> {
        let source: PathBuf = self.file_path(path);
        if !source.is_file() {
            return Err(VfsError::PathNotFound(path.to_string()));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, dest)?;
        Ok(())
    }
}
