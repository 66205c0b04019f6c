use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::descriptor::DEFAULT_FILENAME_PREFIX;
use crate::error::{CommitlogError, CommitlogResult};
use crate::position::MAX_SHARDS;

/// Disk-alignment boundary every chunk is padded to.
pub const ALIGNMENT: usize = 4096;

/// Default size of a segment's in-memory write buffer. A buffer growing past
/// this triggers an opportunistic background cycle.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Minimum allowed segment size (1 MiB).
const SEGMENT_SIZE_MIN_LIMIT: u64 = 1024 * 1024;

/// Maximum allowed segment size. Byte offsets within a segment are 32-bit.
const SEGMENT_SIZE_MAX_LIMIT: u64 = u32::MAX as u64;

/// Durability mode for accepted records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// `add` does not return until the record's buffer reached stable storage.
    Batch,
    /// `add` returns once the record is buffered; a timer syncs every
    /// `sync_period_ms`.
    #[default]
    Periodic,
}

/// Commitlog configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitlogConfig {
    /// Directory the segment files live in.
    pub directory: PathBuf,
    /// Segment file-name prefix, separator included.
    pub fname_prefix: String,
    /// Maximum size of a single segment file, in MiB.
    pub segment_size_mb: u64,
    /// Total disk budget for all live segment files, in MiB.
    pub total_space_mb: u64,
    /// Periodic sync interval, in milliseconds.
    pub sync_period_ms: u64,
    pub mode: SyncMode,
    /// Rename deleted segment files for reuse instead of removing them.
    pub reuse_segments: bool,
    /// Pre-zero fresh segment files so synchronous writes behave correctly.
    pub use_synchronous_writes: bool,
    /// Upper bound for the pre-allocated segment reserve.
    pub max_reserve_segments: usize,
    /// Advisory bound on concurrent writers, exposed to callers sizing their
    /// own dispatch.
    pub max_active_writes: u64,
    /// Bound on concurrent storage-level flushes.
    pub max_active_flushes: u64,
    /// Shard identity embedded in the high bits of every segment id.
    pub shard: u32,
}

impl Default for CommitlogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("commitlog"),
            fname_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            segment_size_mb: 32,
            total_space_mb: 1024,
            sync_period_ms: 10_000,
            mode: SyncMode::default(),
            reuse_segments: true,
            use_synchronous_writes: false,
            max_reserve_segments: 12,
            max_active_writes: 25,
            max_active_flushes: 5,
            shard: 0,
        }
    }
}

impl CommitlogConfig {
    /// Validates and clamps the configuration, returning the copy the segment
    /// manager will actually run with.
    pub fn normalized(mut self) -> CommitlogResult<Self> {
        if self.directory.as_os_str().is_empty() {
            return Err(CommitlogError::invalid_config("directory must not be empty"));
        }
        if self.fname_prefix.is_empty() {
            return Err(CommitlogError::invalid_config(
                "fname_prefix must not be empty",
            ));
        }
        if self.shard >= MAX_SHARDS {
            return Err(CommitlogError::invalid_config(format!(
                "shard {} out of range (max {})",
                self.shard,
                MAX_SHARDS - 1
            )));
        }

        let segment_bytes = self.segment_size_mb.saturating_mul(1024 * 1024);
        if segment_bytes < SEGMENT_SIZE_MIN_LIMIT || segment_bytes > SEGMENT_SIZE_MAX_LIMIT {
            return Err(CommitlogError::invalid_config(format!(
                "segment_size_mb {} outside supported range",
                self.segment_size_mb
            )));
        }
        if self.total_space_mb < self.segment_size_mb {
            return Err(CommitlogError::invalid_config(
                "total_space_mb must hold at least one segment",
            ));
        }

        self.sync_period_ms = self.sync_period_ms.max(1);
        self.max_active_flushes = self.max_active_flushes.max(1);
        self.max_active_writes = self.max_active_writes.max(1);
        self.max_reserve_segments = self.max_reserve_segments.max(1);
        Ok(self)
    }

    pub fn segment_size_bytes(&self) -> u64 {
        self.segment_size_mb * 1024 * 1024
    }

    pub fn total_space_bytes(&self) -> u64 {
        self.total_space_mb * 1024 * 1024
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_normalize() {
        let cfg = CommitlogConfig::default().normalized().unwrap();
        assert_eq!(cfg.segment_size_mb, 32);
        assert_eq!(cfg.mode, SyncMode::Periodic);
    }

    #[test]
    fn rejects_tiny_segments() {
        let cfg = CommitlogConfig {
            segment_size_mb: 0,
            ..Default::default()
        };
        assert!(cfg.normalized().is_err());
    }

    #[test]
    fn rejects_budget_below_one_segment() {
        let cfg = CommitlogConfig {
            segment_size_mb: 32,
            total_space_mb: 16,
            ..Default::default()
        };
        assert!(cfg.normalized().is_err());
    }

    #[test]
    fn rejects_out_of_range_shard() {
        let cfg = CommitlogConfig {
            shard: MAX_SHARDS,
            ..Default::default()
        };
        assert!(cfg.normalized().is_err());
    }

    #[test]
    fn align_up_boundaries() {
        assert_eq!(align_up(0, ALIGNMENT), 0);
        assert_eq!(align_up(1, ALIGNMENT), ALIGNMENT);
        assert_eq!(align_up(ALIGNMENT, ALIGNMENT), ALIGNMENT);
        assert_eq!(align_up(ALIGNMENT + 1, ALIGNMENT), 2 * ALIGNMENT);
    }
}
