//! Reparse metadata codec.
//!
//! Every placeholder and full file carries a fixed-size record identifying
//! the backing-store content it was projected from: an epoch and a content
//! digest.
//!
//! # Record Layout
//! ```text
//! offset  size  field
//! 0       1     format version (RECORD_FORMAT_VERSION)
//! 1       1     content id length (CONTENT_ID_LEN)
//! 2       2     reserved, zero
//! 4       8     epoch, little-endian u64
//! 12      20    content id bytes
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::VfsError;

/// Length of a content digest in bytes (SHA-1 sized object ids).
pub const CONTENT_ID_LEN: usize = 20;

/// Size of an encoded reparse record.
pub const RECORD_SIZE: usize = 12 + CONTENT_ID_LEN;

/// Record format understood by this build.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Fixed-length content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; CONTENT_ID_LEN]);

impl ContentId {
    /// Wrap raw digest bytes.
    pub const fn new(bytes: [u8; CONTENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, checking the digest length.
    ///
    /// # Arguments
    /// * `bytes` - Digest bytes from the backing store
    ///
    /// # Returns
    /// Content id, or `SchemaMismatch` if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, VfsError> {
        let array: [u8; CONTENT_ID_LEN] =
            bytes.try_into().map_err(|_| VfsError::SchemaMismatch {
                expected: CONTENT_ID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Parse a hex digest.
    ///
    /// # Arguments
    /// * `hex_str` - Hex-encoded digest (case-insensitive)
    pub fn from_hex(hex_str: &str) -> Result<Self, VfsError> {
        let bytes: Vec<u8> = hex::decode(hex_str)
            .map_err(|e| VfsError::MalformedMetadata(format!("content id {}: {}", hex_str, e)))?;
        Self::from_slice(&bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_LEN] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity of the backing-store content a placeholder projects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlaceholderVersion {
    /// Backing-store generation.
    pub epoch: u64,
    /// Expected content digest at this epoch.
    pub content_id: ContentId,
}

impl PlaceholderVersion {
    /// Create a version.
    pub fn new(epoch: u64, content_id: ContentId) -> Self {
        Self { epoch, content_id }
    }
}

/// Encode an epoch and content id into a fixed-size record.
///
/// # Arguments
/// * `epoch` - Backing-store generation
/// * `content_id` - Content digest
///
/// # Returns
/// Record of exactly `RECORD_SIZE` bytes.
pub fn encode(epoch: u64, content_id: &ContentId) -> [u8; RECORD_SIZE] {
    let mut record: [u8; RECORD_SIZE] = [0u8; RECORD_SIZE];
    record[0] = RECORD_FORMAT_VERSION;
    record[1] = CONTENT_ID_LEN as u8;
    record[4..12].copy_from_slice(&epoch.to_le_bytes());
    record[12..].copy_from_slice(content_id.as_bytes());
    record
}

/// Decode a reparse record.
///
/// Bytes beyond `RECORD_SIZE` are ignored.
///
/// # Arguments
/// * `bytes` - Encoded record
///
/// # Returns
/// `(epoch, content_id)`, `MalformedMetadata` for truncated or unknown
/// records, `SchemaMismatch` for a foreign digest length.
pub fn decode(bytes: &[u8]) -> Result<(u64, ContentId), VfsError> {
    if bytes.len() < RECORD_SIZE {
        return Err(VfsError::MalformedMetadata(format!(
            "record is {} bytes, expected {}",
            bytes.len(),
            RECORD_SIZE
        )));
    }

    if bytes[0] != RECORD_FORMAT_VERSION {
        return Err(VfsError::MalformedMetadata(format!(
            "unknown record format version {}",
            bytes[0]
        )));
    }

    if bytes[2] != 0 || bytes[3] != 0 {
        return Err(VfsError::MalformedMetadata(
            "reserved bytes are not zero".to_string(),
        ));
    }

    let id_len: usize = bytes[1] as usize;
    if id_len != CONTENT_ID_LEN {
        return Err(VfsError::SchemaMismatch {
            expected: CONTENT_ID_LEN,
            actual: id_len,
        });
    }

    let mut epoch_bytes: [u8; 8] = [0u8; 8];
    epoch_bytes.copy_from_slice(&bytes[4..12]);
    let epoch: u64 = u64::from_le_bytes(epoch_bytes);
    let content_id: ContentId = ContentId::from_slice(&bytes[12..RECORD_SIZE])?;

    Ok((epoch, content_id))
}

/// Raw reparse record as attached to a path.
///
/// Kept undecoded so that a corrupted record only affects its own path;
/// callers decode through [`ReparseRecord::version`] at the point of use.
#[derive(Clone, PartialEq, Eq)]
pub struct ReparseRecord(Vec<u8>);

impl ReparseRecord {
    /// Encode a version into a record.
    pub fn from_version(version: &PlaceholderVersion) -> Self {
        Self(encode(version.epoch, &version.content_id).to_vec())
    }

    /// Wrap bytes read from persistent storage without validation.
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the record.
    pub fn version(&self) -> Result<PlaceholderVersion, VfsError> {
        let (epoch, content_id) = decode(&self.0)?;
        Ok(PlaceholderVersion { epoch, content_id })
    }
}

impl fmt::Debug for ReparseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReparseRecord({})", hex::encode(&self.0))
    }
}

impl Serialize for ReparseRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ReparseRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text: String = String::deserialize(deserializer)?;
        let bytes: Vec<u8> = hex::decode(&text).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}
