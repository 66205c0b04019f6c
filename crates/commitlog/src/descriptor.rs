//! Segment file-name grammar: `[Recycled-]{prefix}{version}-{id}.log`.

use std::path::Path;

use crate::error::{CommitlogError, CommitlogResult};
use crate::position::ReplayPosition;

pub(crate) const FILENAME_EXTENSION: &str = ".log";
pub(crate) const SEPARATOR: &str = "-";
pub(crate) const RECYCLED_PREFIX: &str = "Recycled-";

/// Default file-name prefix, separator included.
pub const DEFAULT_FILENAME_PREFIX: &str = "CommitLog-";

/// Current segment format version, embedded in both the file name and the
/// descriptor header.
pub(crate) const DESCRIPTOR_VERSION: u32 = 2;

/// Identity of one segment file: monotonically increasing id (shard bits in
/// the high end) plus format version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub id: u64,
    pub version: u32,
    filename_prefix: String,
}

impl Descriptor {
    pub fn new(id: u64, filename_prefix: &str) -> Self {
        Self {
            id,
            version: DESCRIPTOR_VERSION,
            filename_prefix: filename_prefix.to_string(),
        }
    }

    /// Parses a file name (or path). Accepts the `Recycled-` variant; rejects
    /// the legacy two-field form with a distinct error so callers can report
    /// "too old" rather than silently skipping.
    pub fn parse(filename: &str, filename_prefix: &str) -> CommitlogResult<Self> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CommitlogError::InvalidSegmentName(filename.to_string()))?;

        let bare = name.strip_prefix(RECYCLED_PREFIX).unwrap_or(name);
        let rest = bare
            .strip_prefix(filename_prefix)
            .and_then(|r| r.strip_suffix(FILENAME_EXTENSION))
            .ok_or_else(|| CommitlogError::InvalidSegmentName(filename.to_string()))?;

        match rest.split_once(SEPARATOR) {
            Some((ver, id)) => {
                let version: u32 = ver
                    .parse()
                    .map_err(|_| CommitlogError::InvalidSegmentName(filename.to_string()))?;
                let id: u64 = id
                    .parse()
                    .map_err(|_| CommitlogError::InvalidSegmentName(filename.to_string()))?;
                Ok(Self {
                    id,
                    version,
                    filename_prefix: filename_prefix.to_string(),
                })
            }
            // A single numeric field is the pre-versioned layout.
            None if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() => {
                Err(CommitlogError::SegmentTooOld(filename.to_string()))
            }
            None => Err(CommitlogError::InvalidSegmentName(filename.to_string())),
        }
    }

    pub fn filename(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.filename_prefix, self.version, SEPARATOR, self.id, FILENAME_EXTENSION
        )
    }

    pub fn replay_position(&self) -> ReplayPosition {
        ReplayPosition::new(self.id, 0)
    }
}
