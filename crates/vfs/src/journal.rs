//! Append-only journal persisting path state and directory overlays.
//!
//! # File Format
//! ```text
//! state_dir/
//! └── state.journal      # JSON lines
//!     {"layout_version":1}
//!     {"op":"set_entry","entry":{...}}
//!     {"op":"overlay_deleted","dir":"src","name":"old.rs"}
//!     ...
//! ```
//!
//! Replaying every record in order reconstructs the live state. A torn final
//! line (crash mid-append) is discarded and cut off the file before new
//! records are appended; any other undecodable line fails the load.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::path::VirtualPath;
use crate::state::PathEntry;
use crate::VfsError;

/// Journal file name inside the state directory.
pub const JOURNAL_FILE_NAME: &str = "state.journal";

/// On-disk layout version written in the journal header.
pub const LAYOUT_VERSION: u32 = 1;

/// First line of every journal.
#[derive(Debug, Serialize, Deserialize)]
struct JournalHeader {
    layout_version: u32,
}

/// One persisted mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Entry inserted or replaced.
    SetEntry {
        /// New entry.
        entry: PathEntry,
    },
    /// Entry removed.
    RemoveEntry {
        /// Removed path.
        path: VirtualPath,
    },
    /// Entry moved.
    RenameEntry {
        /// Old path.
        from: VirtualPath,
        /// New path.
        to: VirtualPath,
    },
    /// Child created locally in a directory.
    OverlayCreated {
        /// Parent directory.
        dir: VirtualPath,
        /// Child name.
        name: String,
        /// Whether the child is a directory.
        is_directory: bool,
        /// Size reported in listings.
        #[serde(default)]
        size: u64,
    },
    /// Child deleted locally in a directory.
    OverlayDeleted {
        /// Parent directory.
        dir: VirtualPath,
        /// Child name.
        name: String,
    },
    /// Directory stops consulting the backing listing.
    OverlayExpanded {
        /// Expanded directory.
        dir: VirtualPath,
    },
    /// Whole overlay for a directory dropped.
    OverlayForget {
        /// Directory whose overlay is dropped.
        dir: VirtualPath,
    },
}

/// Result of reading an existing journal.
struct Replay {
    /// Decoded records, oldest first.
    records: Vec<JournalRecord>,
    /// Byte offset just past the last decodable line's content.
    valid_end: u64,
    /// Whether the file is exactly the decodable lines, newline-terminated.
    clean: bool,
}

/// Append-only JSON-lines journal.
pub struct Journal {
    /// Journal file path.
    path: PathBuf,
    /// Buffered writer positioned at the end of the file.
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (or create) the journal in a state directory.
    ///
    /// # Arguments
    /// * `state_dir` - Directory holding the journal
    ///
    /// # Returns
    /// The journal and the records to replay, oldest first.
    pub fn open(state_dir: &Path) -> Result<(Self, Vec<JournalRecord>), VfsError> {
        std::fs::create_dir_all(state_dir)?;
        let path: PathBuf = state_dir.join(JOURNAL_FILE_NAME);

        let records: Vec<JournalRecord> = if path.exists() {
            let replay: Replay = Self::read_records(&path)?;
            if !replay.clean {
                Self::repair_tail(&path, replay.valid_end)?;
            }
            replay.records
        } else {
            Self::write_fresh(&path, &[])?;
            Vec::new()
        };

        let file: File = OpenOptions::new().append(true).open(&path)?;
        tracing::debug!(
            "Opened journal {} with {} records",
            path.display(),
            records.len()
        );

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
            },
            records,
        ))
    }

    /// Append a record and flush it to the OS.
    ///
    /// # Arguments
    /// * `record` - Mutation to persist
    pub fn append(&self, record: &JournalRecord) -> Result<(), VfsError> {
        let line: String = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Replace the journal with a minimal record set.
    ///
    /// Writes to a temp file, syncs, and renames over the journal so a crash
    /// leaves either the old or the new journal intact.
    ///
    /// # Arguments
    /// * `records` - Records that reproduce the live state
    pub fn compact(&self, records: &[JournalRecord]) -> Result<(), VfsError> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        Self::write_fresh(&self.path, records)?;

        let file: File = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        tracing::info!(
            "Compacted journal {} to {} records",
            self.path.display(),
            records.len()
        );
        Ok(())
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a header plus records atomically.
    fn write_fresh(path: &Path, records: &[JournalRecord]) -> Result<(), VfsError> {
        let dir: &Path = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp: NamedTempFile = NamedTempFile::new_in(dir)?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            let header = JournalHeader {
                layout_version: LAYOUT_VERSION,
            };
            serde_json::to_writer(&mut out, &header)?;
            out.write_all(b"\n")?;
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| VfsError::Io(e.error))?;
        Ok(())
    }

    /// Cut everything after the last decodable line and terminate it, so
    /// the next append starts on a fresh line.
    fn repair_tail(path: &Path, valid_end: u64) -> Result<(), VfsError> {
        let file: File = OpenOptions::new().write(true).open(path)?;
        let len: u64 = file.metadata()?.len();
        tracing::warn!(
            "Truncating journal {} from {} to {} bytes",
            path.display(),
            len,
            valid_end + 1
        );
        file.set_len(valid_end)?;
        drop(file);
        let mut file: File = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and validate an existing journal.
    fn read_records(path: &Path) -> Result<Replay, VfsError> {
        let bytes: Vec<u8> = std::fs::read(path)?;

        // (start, end) of each line's content, newline excluded.
        let mut lines: Vec<(usize, usize)> = Vec::new();
        let mut start: usize = 0;
        for (index, byte) in bytes.iter().enumerate() {
            if *byte == b'\n' {
                lines.push((start, index));
                start = index + 1;
            }
        }
        if start < bytes.len() {
            lines.push((start, bytes.len()));
        }

        let mut iter = lines.iter().copied().enumerate();
        let (header, mut valid_end): (JournalHeader, usize) = match iter.next() {
            Some((_, span)) => {
                let line: &str = line_text(&bytes, span)
                    .map_err(|e| VfsError::Journal(format!("bad header: {}", e)))?;
                let header: JournalHeader = serde_json::from_str(line)
                    .map_err(|e| VfsError::Journal(format!("bad header: {}", e)))?;
                (header, span.1)
            }
            None => return Err(VfsError::Journal("journal is empty".to_string())),
        };

        if header.layout_version != LAYOUT_VERSION {
            return Err(VfsError::LayoutVersion {
                expected: LAYOUT_VERSION,
                found: header.layout_version,
            });
        }

        let last_index: usize = lines
            .iter()
            .rposition(|&span| !is_blank(&bytes, span))
            .unwrap_or(0);
        let mut records: Vec<JournalRecord> = Vec::with_capacity(lines.len());
        for (index, span) in iter {
            if is_blank(&bytes, span) {
                continue;
            }
            let decoded: Result<JournalRecord, String> = line_text(&bytes, span)
                .map_err(|e| e.to_string())
                .and_then(|line| serde_json::from_str(line).map_err(|e| e.to_string()));
            match decoded {
                Ok(record) => {
                    records.push(record);
                    valid_end = span.1;
                }
                Err(e) if index == last_index => {
                    tracing::warn!("Discarding torn journal tail at line {}: {}", index + 1, e);
                }
                Err(e) => {
                    return Err(VfsError::Journal(format!("line {}: {}", index + 1, e)));
                }
            }
        }

        let clean: bool = valid_end + 1 == bytes.len() && bytes[valid_end] == b'\n';
        Ok(Replay {
            records,
            valid_end: valid_end as u64,
            clean,
        })
    }
}

fn line_text(bytes: &[u8], (start, end): (usize, usize)) -> Result<&str, std::str::Utf8Error> {
    std::str::from_utf8(&bytes[start..end])
}

fn is_blank(bytes: &[u8], (start, end): (usize, usize)) -> bool {
    bytes[start..end].iter().all(u8::is_ascii_whitespace)
}
