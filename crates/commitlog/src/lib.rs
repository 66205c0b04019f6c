//! A durable, segmented commit log (write-ahead log).
//!
//! Records are appended to a series of fixed-size segment files. Each accepted
//! record is assigned a [`ReplayPosition`] and returns an [`RpHandle`], an
//! RAII token tying the record to its segment: once the owner has persisted
//! the data elsewhere it hands the accumulated handles back via
//! [`Commitlog::discard_completed_segments`], letting fully-persisted segments
//! be deleted or recycled. After a crash, [`SegmentReplayer`] walks the
//! surviving files and recovers every record that reached the disk intact.
//!
//! Two durability modes are supported: `periodic` syncs on a timer and `add`
//! returns as soon as the record is buffered, while `batch` holds each `add`
//! until the record's bytes are on stable storage.
//!
//! ```no_run
//! use commitlog::{Commitlog, CommitlogConfig, OwnerId};
//! use tokio::time::{Duration, Instant};
//!
//! # async fn demo() -> commitlog::CommitlogResult<()> {
//! let log = Commitlog::create(CommitlogConfig {
//!     directory: "/var/lib/myapp/commitlog".into(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let deadline = Instant::now() + Duration::from_secs(10);
//! let handle = log.add_entry(OwnerId(1), b"hello", deadline).await?;
//! println!("written at {}", handle.rp());
//! log.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod crc;
mod descriptor;
mod error;
mod flush_queue;
mod manager;
mod position;
mod reader;
mod segment;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;

pub use config::{CommitlogConfig, SyncMode, ALIGNMENT, DEFAULT_BUFFER_SIZE};
pub use descriptor::{Descriptor, DEFAULT_FILENAME_PREFIX};
pub use error::{CommitlogError, CommitlogResult};
pub use manager::{CommitlogMetrics, FlushHandler, FlushHandlerId};
pub use position::{OwnerId, ReplayPosition, RpHandle, RpSet, MAX_SHARDS, SHARD_BITS};
pub use reader::{read_log_file, SegmentReplayer};

use manager::SegmentManager;

/// Source of one record's bytes.
///
/// `write` must append exactly `size()` bytes; the log verifies the contract
/// and rejects the record otherwise. Returning `true` from `sync` forces this
/// record to stable storage before `add` returns, even in periodic mode.
pub trait EntryWriter: Send + Sync {
    fn size(&self) -> usize;
    fn write(&self, out: &mut Vec<u8>);
    fn sync(&self) -> bool {
        false
    }
}

struct SliceWriter<'a>(&'a [u8]);

impl EntryWriter for SliceWriter<'_> {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.0);
    }
}

/// Keeps a flush handler registered for as long as it is held.
#[must_use = "dropping the anchor unregisters the flush handler"]
pub struct FlushHandlerAnchor {
    manager: Arc<SegmentManager>,
    id: FlushHandlerId,
}

impl FlushHandlerAnchor {
    /// Unregisters the handler now instead of at drop time.
    pub fn release(self) {}
}

impl Drop for FlushHandlerAnchor {
    fn drop(&mut self) {
        self.manager.remove_flush_handler(self.id);
    }
}

/// Handle to one commitlog instance.
///
/// Cheap to clone; all clones share the same segment pool. The log keeps
/// running until [`shutdown`](Self::shutdown) completes, which every clone may
/// call (and await) safely.
#[derive(Clone)]
pub struct Commitlog {
    manager: Arc<SegmentManager>,
}

impl Commitlog {
    /// Creates (or re-opens) a commitlog in the configured directory and
    /// starts its background tasks. Existing segment files are left untouched
    /// and reported by [`segments_to_replay`](Self::segments_to_replay).
    pub async fn create(cfg: CommitlogConfig) -> CommitlogResult<Self> {
        let manager = SegmentManager::new(cfg)?;
        manager.init().await?;
        Ok(Self { manager })
    }

    /// Appends one record produced by `writer` on behalf of `owner`.
    ///
    /// Returns once the record is buffered (periodic mode) or durable (batch
    /// mode, or `writer.sync()`), or fails with
    /// [`CommitlogError::Timeout`] when `deadline` passes first. The returned
    /// handle must be kept until the owner no longer needs the record
    /// replayed.
    pub async fn add(
        &self,
        owner: OwnerId,
        writer: &dyn EntryWriter,
        deadline: Instant,
    ) -> CommitlogResult<RpHandle> {
        self.manager
            .allocate_when_possible(owner, writer, deadline)
            .await
    }

    /// Convenience wrapper around [`add`](Self::add) for a byte slice.
    pub async fn add_entry(
        &self,
        owner: OwnerId,
        payload: &[u8],
        deadline: Instant,
    ) -> CommitlogResult<RpHandle> {
        self.add(owner, &SliceWriter(payload), deadline).await
    }

    /// Largest payload a single `add` will accept.
    pub fn max_record_size(&self) -> u64 {
        self.manager.max_record_size()
    }

    /// Tells the log that `owner` has persisted the records whose handles were
    /// absorbed into `used`; segments with no remaining dirty records become
    /// eligible for deletion or recycling.
    pub fn discard_completed_segments(&self, owner: OwnerId, used: &RpSet) {
        self.manager.discard_completed_segments_set(owner, used);
    }

    /// Drops every dirty record `owner` has in the log, e.g. when the owning
    /// entity itself is being removed.
    pub fn discard_all_for_owner(&self, owner: OwnerId) {
        self.manager.discard_completed_segments(owner);
    }

    /// Registers a callback invoked when the log wants `owner`s to persist
    /// their state up to a given position, so disk space can be reclaimed.
    pub fn add_flush_handler(&self, handler: FlushHandler) -> FlushHandlerAnchor {
        let id = self.manager.add_flush_handler(handler);
        FlushHandlerAnchor {
            manager: Arc::clone(&self.manager),
            id,
        }
    }

    /// Forces every segment's buffered data to stable storage.
    pub async fn sync_all_segments(&self) -> CommitlogResult<()> {
        self.manager.sync_all_segments().await
    }

    /// Drains in-flight writes, syncs and closes every segment and stops the
    /// background tasks. Further `add` calls fail with
    /// [`CommitlogError::Shutdown`]. Idempotent.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Shuts down and removes every file the log owns. Test support.
    pub async fn clear(&self) {
        self.manager.clear().await;
    }

    /// Segment files found at startup, ordered by segment id; replay these
    /// before writing new data.
    pub fn segments_to_replay(&self) -> Vec<PathBuf> {
        self.manager.segments_to_replay()
    }

    /// Lists the descriptors of every commitlog file currently in the
    /// configured directory.
    pub async fn list_existing_segments(&self) -> CommitlogResult<Vec<Descriptor>> {
        let mut descs = self
            .manager
            .list_descriptors(&self.manager.config().directory)
            .await?;
        descs.sort_by_key(|d| d.id);
        Ok(descs)
    }

    /// Deletes the given segment files, recycling them when configuration and
    /// the disk budget allow.
    pub async fn delete_segments(&self, files: Vec<PathBuf>) {
        self.manager.delete_segments(files).await;
    }

    pub fn active_config(&self) -> &CommitlogConfig {
        self.manager.config()
    }

    pub fn metrics(&self) -> CommitlogMetrics {
        self.manager.metrics()
    }

    /// Paths of segments still holding live data.
    pub fn active_segment_names(&self) -> Vec<PathBuf> {
        self.manager.active_segment_names()
    }

    pub fn num_active_segments(&self) -> usize {
        self.manager.num_active_segments()
    }

    pub fn num_dirty_segments(&self) -> usize {
        self.manager.num_dirty_segments()
    }

    /// Bytes of disk currently allocated to segment files, reserve and
    /// recycled files included.
    pub fn disk_footprint(&self) -> u64 {
        self.metrics().total_size_on_disk
    }
}
