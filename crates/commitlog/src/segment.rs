//! A single commitlog segment file plus its in-memory write buffer.
//!
//! Records are appended to the buffer; a "cycle" pads the buffer to the disk
//! alignment and writes it at the segment's current file position, and a
//! "flush" forces previously-cycled bytes to stable storage. Physical writes
//! may complete out of order; the pending-operation queue guarantees a flush
//! at position P only reports success once every write at a position <= P has
//! finished. Tracking which owners still have unpersisted records in the
//! segment ("dirty counts") decides when the file may be deleted or recycled.

use std::collections::HashMap;
use std::fs::File;
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::config::{align_up, ALIGNMENT, DEFAULT_BUFFER_SIZE};
use crate::crc::Crc32Be;
use crate::descriptor::Descriptor;
use crate::error::{CommitlogError, CommitlogResult};
use crate::flush_queue::{FlushQueue, PendingOp};
use crate::manager::SegmentManager;
use crate::position::{DirtyTracker, OwnerId, ReplayPosition, RpHandle};
use crate::{EntryWriter, SyncMode};

/// Entry framing overhead: size + header crc + payload crc.
pub(crate) const ENTRY_OVERHEAD_SIZE: usize = 3 * 4;
/// Chunk header: next-offset + crc.
pub(crate) const SEGMENT_OVERHEAD_SIZE: usize = 2 * 4;
/// Descriptor header: magic + version + id + crc.
pub(crate) const DESCRIPTOR_HEADER_SIZE: usize = 5 * 4;
/// "SCLC".
pub(crate) const SEGMENT_MAGIC: u32 = (b'S' as u32) << 24 | (b'C' as u32) << 16 | (b'L' as u32) << 8 | b'C' as u32;

/// Outcome of one allocation attempt against a specific segment.
pub(crate) enum AllocateOutcome {
    Handle(RpHandle),
    /// The segment is full or closed; the caller should retry on a fresh one.
    Rollover,
}

struct WriteState {
    buffer: Vec<u8>,
    /// Capacity the current buffer was sized for; exceeding it forces a cycle.
    buffer_cap: usize,
    /// Admission permits backing the buffered records, released once their
    /// bytes reach the file.
    permits: Vec<OwnedSemaphorePermit>,
    file_pos: u64,
    num_allocs: u64,
    dirty: HashMap<OwnerId, u64>,
}

/// One cycle's worth of buffered data, detached from the segment under the
/// state lock so the write itself runs without holding it.
struct CycleJob {
    buf: Vec<u8>,
    /// Capacity charged against the buffer-bytes gauge when allocated.
    cap: usize,
    off: u64,
    top: u64,
    permits: Vec<OwnedSemaphorePermit>,
    num_allocs: u64,
    termination: bool,
    /// Registered before the state lock is released so flushes always observe
    /// this write as pending.
    op: Option<PendingOp>,
}

pub(crate) struct Segment {
    manager: Weak<SegmentManager>,
    desc: Descriptor,
    path: PathBuf,
    file: Arc<File>,
    state: Mutex<WriteState>,
    pending_ops: FlushQueue,
    file_pos: AtomicU64,
    flush_pos: AtomicU64,
    closed: AtomicBool,
    terminated: AtomicBool,
    sync_time: Mutex<Instant>,
}

impl Segment {
    pub(crate) fn new(
        manager: Weak<SegmentManager>,
        desc: Descriptor,
        path: PathBuf,
        file: File,
    ) -> Arc<Self> {
        let segment = Arc::new(Self {
            manager,
            desc,
            path,
            file: Arc::new(file),
            state: Mutex::new(WriteState {
                buffer: Vec::new(),
                buffer_cap: 0,
                permits: Vec::new(),
                file_pos: 0,
                num_allocs: 0,
                dirty: HashMap::new(),
            }),
            pending_ops: FlushQueue::new(),
            file_pos: AtomicU64::new(0),
            flush_pos: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            sync_time: Mutex::new(Instant::now()),
        });
        debug!(segment = %segment.name(), "created new segment");
        segment
    }

    fn manager(&self) -> CommitlogResult<Arc<SegmentManager>> {
        self.manager.upgrade().ok_or(CommitlogError::Shutdown)
    }

    pub(crate) fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub(crate) fn name(&self) -> String {
        self.desc.filename()
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn file_position(&self) -> u64 {
        self.file_pos.load(Ordering::Acquire)
    }

    pub(crate) fn flush_position(&self) -> u64 {
        self.flush_pos.load(Ordering::Acquire)
    }

    /// Logical position: file position plus whatever sits in the buffer.
    pub(crate) fn position(&self) -> u64 {
        let state = self.state.lock();
        state.file_pos + state.buffer.len() as u64
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_still_allocating(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.manager.upgrade() {
            Some(mgr) => self.position() < mgr.max_size(),
            None => false,
        }
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.state.lock().dirty.is_empty()
    }

    pub(crate) fn is_unused(&self) -> bool {
        !self.is_still_allocating() && self.is_clean()
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.position() <= self.flush_position()
    }

    /// True when `rp` names a record written to this segment.
    pub(crate) fn contains(&self, rp: ReplayPosition) -> bool {
        rp.id == self.desc.id && (rp.pos as u64) < self.position()
    }

    pub(crate) fn can_delete(&self) -> bool {
        self.is_unused() && self.is_flushed() && self.pending_ops.is_empty()
    }

    pub(crate) fn dirty_owners(&self) -> Vec<OwnerId> {
        self.state.lock().dirty.keys().copied().collect()
    }

    pub(crate) fn mark_clean(&self, owner: OwnerId, count: u64) {
        let mut state = self.state.lock();
        if let Some(current) = state.dirty.get_mut(&owner) {
            *current = current.saturating_sub(count);
            if *current == 0 {
                state.dirty.remove(&owner);
            }
        }
    }

    pub(crate) fn mark_clean_owner(&self, owner: OwnerId) {
        self.state.lock().dirty.remove(&owner);
    }

    pub(crate) fn mark_clean_all(&self) {
        self.state.lock().dirty.clear();
    }

    pub(crate) fn reset_sync_time(&self) {
        *self.sync_time.lock() = Instant::now();
    }

    /// In periodic mode, a segment that has not synced for two full periods
    /// forces one before accepting more data, bounding worst-case replay lag.
    fn must_sync(&self, mgr: &SegmentManager) -> bool {
        if mgr.config().mode == SyncMode::Batch {
            return false;
        }
        let elapsed = self.sync_time.lock().elapsed();
        let period_ms = mgr.config().sync_period_ms;
        if elapsed.as_millis() as u64 > period_ms * 2 {
            debug!(segment = %self.name(), elapsed_ms = elapsed.as_millis() as u64, "needs sync");
            return true;
        }
        false
    }

    /// Appends one record. Returns `Rollover` when the record no longer fits
    /// this segment; the segment closes itself in the background and the
    /// manager retries on a new one.
    pub(crate) async fn allocate(
        self: &Arc<Self>,
        owner: OwnerId,
        writer: &dyn EntryWriter,
        permit: &mut Option<OwnedSemaphorePermit>,
        deadline: Instant,
    ) -> CommitlogResult<AllocateOutcome> {
        let mgr = self.manager()?;
        let size = writer.size();
        let total = size + ENTRY_OVERHEAD_SIZE;
        mgr.sanity_check_size(total as u64)?;

        let batch = mgr.config().mode == SyncMode::Batch || writer.sync();

        loop {
            if self.must_sync(&mgr) {
                self.awaited_sync(deadline).await?;
                continue;
            }

            enum Post {
                None,
                Batch,
                Background(CycleJob),
            }

            // Decide and append under one lock acquisition so concurrent
            // allocators observe a consistent buffer.
            let (handle, post) = {
                let mut state = self.state.lock();

                if self.is_closed()
                    || state.file_pos + state.buffer.len() as u64 + total as u64 > mgr.max_size()
                {
                    drop(state);
                    // Mark unwritable immediately so the manager stops
                    // handing this segment out; the close itself (final
                    // cycle, flush, termination) runs in the background.
                    self.closed.store(true, Ordering::Release);
                    let segment = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = segment.close().await {
                            error!(segment = %segment.name(), error = %err, "failed to close full segment");
                        }
                    });
                    return Ok(AllocateOutcome::Rollover);
                }

                if !state.buffer.is_empty() && state.buffer.len() + total > state.buffer_cap {
                    if batch {
                        // Must keep flush order: force the cycle and wait.
                        drop(state);
                        self.awaited_sync(deadline).await?;
                        continue;
                    }
                    // Push the full buffer out in the background and carry on
                    // against a fresh one.
                    let job = self.begin_cycle(&mut state, false);
                    if let Some(job) = job {
                        let segment = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(err) = segment.perform_cycle(job, false).await {
                                error!(segment = %segment.name(), error = %err, "background cycle failed");
                            }
                        });
                    }
                }

                if state.buffer.is_empty() {
                    self.new_buffer(&mut state, total, &mgr);
                }

                let entry_start = state.buffer.len();
                let rp = ReplayPosition::new(
                    self.desc.id,
                    (state.file_pos + entry_start as u64) as u32,
                );
                if let Err(err) = Self::write_entry(&mut state.buffer, size, writer) {
                    // A misbehaving writer must not poison the chunk.
                    state.buffer.truncate(entry_start);
                    return Err(err);
                }
                *state.dirty.entry(owner).or_insert(0) += 1;
                state.num_allocs += 1;
                state.permits.extend(permit.take());
                mgr.totals().allocation_count.fetch_add(1, Ordering::Relaxed);

                let tracker: Arc<dyn DirtyTracker> = Arc::clone(self) as _;
                let handle = RpHandle::new(tracker, owner, rp);

                let post = if batch {
                    Post::Batch
                } else if state.buffer.len() >= DEFAULT_BUFFER_SIZE {
                    // This buffer alone outgrew the default size; no later
                    // request is guaranteed to cycle it for us.
                    self.begin_cycle(&mut state, false).map_or(Post::None, Post::Background)
                } else {
                    Post::None
                };
                (handle, post)
            };

            match post {
                Post::None => {}
                Post::Background(job) => {
                    let segment = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = segment.perform_cycle(job, false).await {
                            error!(segment = %segment.name(), error = %err, "background cycle failed");
                        }
                    });
                }
                Post::Batch => self.batch_cycle(deadline).await?,
            }

            debug_assert!(self.contains(handle.rp()));
            return Ok(AllocateOutcome::Handle(handle));
        }
    }

    fn write_entry(
        buffer: &mut Vec<u8>,
        payload_size: usize,
        writer: &dyn EntryWriter,
    ) -> CommitlogResult<()> {
        let total = (payload_size + ENTRY_OVERHEAD_SIZE) as u32;

        buffer.extend_from_slice(&total.to_be_bytes());
        let mut crc = Crc32Be::new();
        crc.write_u32(total);
        buffer.extend_from_slice(&crc.checksum().to_be_bytes());

        let payload_start = buffer.len();
        writer.write(buffer);
        if buffer.len() - payload_start != payload_size {
            return Err(CommitlogError::internal(format!(
                "entry writer produced {} bytes, declared {}",
                buffer.len() - payload_start,
                payload_size
            )));
        }

        let mut crc = Crc32Be::new();
        crc.write_bytes(&buffer[payload_start..]);
        buffer.extend_from_slice(&crc.checksum().to_be_bytes());
        Ok(())
    }

    /// Allocates a fresh buffer, reserving space for the chunk header (and the
    /// descriptor header on the very first chunk).
    fn new_buffer(&self, state: &mut WriteState, entry_size: usize, mgr: &SegmentManager) {
        debug_assert!(state.buffer.is_empty());
        let mut overhead = SEGMENT_OVERHEAD_SIZE;
        if state.file_pos == 0 {
            overhead += DESCRIPTOR_HEADER_SIZE;
        }
        let cap = align_up(entry_size + overhead, ALIGNMENT).max(DEFAULT_BUFFER_SIZE);
        state.buffer = Vec::with_capacity(cap);
        state.buffer.resize(overhead, 0);
        state.buffer_cap = cap;
        mgr.totals()
            .buffer_list_bytes
            .fetch_add(cap as u64, Ordering::Relaxed);
    }

    /// Detaches the buffer for writing: fills in headers later, pads to the
    /// alignment boundary, and advances the logical file position.
    fn begin_cycle(&self, state: &mut WriteState, termination: bool) -> Option<CycleJob> {
        if state.buffer.is_empty() {
            if !termination {
                return None;
            }
            if let Ok(mgr) = self.manager() {
                self.new_buffer(state, 0, &mgr);
            } else {
                return None;
            }
        }

        let buf_pos = state.buffer.len();
        let padded = align_up(buf_pos, ALIGNMENT);
        state.buffer.resize(padded, 0);
        if let Ok(mgr) = self.manager() {
            mgr.totals()
                .bytes_slack
                .fetch_add((padded - buf_pos) as u64, Ordering::Relaxed);
        }

        let buf = mem::take(&mut state.buffer);
        let cap = mem::replace(&mut state.buffer_cap, 0);
        let permits = mem::take(&mut state.permits);
        let num_allocs = mem::replace(&mut state.num_allocs, 0);

        let off = state.file_pos;
        let top = off + buf.len() as u64;
        state.file_pos = top;
        self.file_pos.store(top, Ordering::Release);

        let op = self.pending_ops.register(ReplayPosition::new(self.desc.id, off as u32));

        Some(CycleJob {
            buf,
            cap,
            off,
            top,
            permits,
            num_allocs,
            termination,
            op: Some(op),
        })
    }

    /// Writes one detached buffer at its file offset, in issue order relative
    /// to flushes via the pending-operation queue.
    async fn perform_cycle(self: &Arc<Self>, mut job: CycleJob, flush_after: bool) -> CommitlogResult<()> {
        let mgr = self.manager()?;

        let mut header_size = 0;
        if job.off == 0 {
            let mut crc = Crc32Be::new();
            crc.write_u32(self.desc.version);
            crc.write_u64(self.desc.id);
            job.buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_be_bytes());
            job.buf[4..8].copy_from_slice(&self.desc.version.to_be_bytes());
            job.buf[8..16].copy_from_slice(&self.desc.id.to_be_bytes());
            job.buf[16..20].copy_from_slice(&crc.checksum().to_be_bytes());
            header_size = DESCRIPTOR_HEADER_SIZE;
        }

        if !job.termination {
            let mut crc = Crc32Be::new();
            crc.write_u64(self.desc.id);
            crc.write_u32(job.top as u32);
            job.buf[header_size..header_size + 4].copy_from_slice(&(job.top as u32).to_be_bytes());
            job.buf[header_size + 4..header_size + 8]
                .copy_from_slice(&crc.checksum().to_be_bytes());
            trace!(segment = %self.name(), entries = job.num_allocs, bytes = job.buf.len(),
                from = job.off, to = job.top, "writing chunk");
        } else {
            debug_assert_eq!(job.num_allocs, 0);
            trace!(segment = %self.name(), pos = job.top, "terminating");
        }

        let op = job
            .op
            .take()
            .ok_or_else(|| CommitlogError::internal("cycle job reused"))?;

        let file = Arc::clone(&self.file);
        let buf = mem::take(&mut job.buf);
        let off = job.off;
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            file.write_all_at(&buf, off)?;
            Ok(buf.len())
        })
        .await
        .map_err(|e| CommitlogError::internal(e))?;

        let totals = mgr.totals();
        totals
            .buffer_list_bytes
            .fetch_sub(job.cap as u64, Ordering::Relaxed);
        // Admission units for the cycled records are free again.
        job.permits.clear();

        let size = match written {
            Ok(size) => size,
            Err(err) => {
                error!(segment = %self.name(), error = %err, "failed to persist commits to disk");
                self.closed.store(true, Ordering::Release);
                op.complete();
                return Err(err.into());
            }
        };

        totals.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
        totals.active_size_on_disk.fetch_add(size as u64, Ordering::Relaxed);
        totals.cycle_count.fetch_add(1, Ordering::Relaxed);

        if flush_after {
            // Keep the pending op live across the flush so batch waiters
            // observing its completion know the data is durable.
            let result = self.do_flush(job.top).await;
            op.complete();
            result
        } else {
            op.complete();
            Ok(())
        }
    }

    /// Buffer to disk, then disk to stable storage.
    pub(crate) async fn sync(self: &Arc<Self>) -> CommitlogResult<()> {
        self.reset_sync_time();
        self.cycle(true, false).await
    }

    pub(crate) async fn cycle(self: &Arc<Self>, flush_after: bool, termination: bool) -> CommitlogResult<()> {
        let job = {
            let mut state = self.state.lock();
            self.begin_cycle(&mut state, termination)
        };
        match job {
            Some(job) => self.perform_cycle(job, flush_after).await,
            None if flush_after => self.flush().await,
            None => Ok(()),
        }
    }

    /// Flushes everything cycled so far, after all earlier writes completed.
    pub(crate) async fn flush(self: &Arc<Self>) -> CommitlogResult<()> {
        let pos = self.file_position();
        trace!(segment = %self.name(), from = self.flush_position(), to = pos, "syncing");
        // Writes at lower positions registered before this point; their start
        // offsets all lie below pos.
        self.pending_ops
            .wait_for_pending_upto(ReplayPosition::new(self.desc.id, pos.saturating_sub(1) as u32))
            .await;
        self.do_flush(pos).await
    }

    async fn do_flush(self: &Arc<Self>, pos: u64) -> CommitlogResult<()> {
        let mgr = self.manager()?;
        let _gate = mgr.begin_flush().await?;

        if pos <= self.flush_position() {
            trace!(segment = %self.name(), pos, flushed = self.flush_position(), "already synced");
            return Ok(());
        }

        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| CommitlogError::internal(e))?;

        match result {
            Ok(()) => {
                self.flush_pos.fetch_max(pos, Ordering::AcqRel);
                mgr.totals().flush_count.fetch_add(1, Ordering::Relaxed);
                trace!(segment = %self.name(), pos = self.flush_position(), "synced");
                Ok(())
            }
            Err(err) => {
                error!(segment = %self.name(), error = %err, "failed to flush commits to disk");
                self.closed.store(true, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// Batch-mode durability: wait out all pending writes/flushes, then either
    /// piggy-back on the cycle another batch caller already forced or force
    /// one ourselves. Coalesces several allocations into a single buffer.
    ///
    /// A missed deadline leaves the segment writable; the cycle and flush
    /// paths retire it themselves when the underlying I/O actually fails.
    async fn batch_cycle(self: &Arc<Self>, deadline: Instant) -> CommitlogResult<()> {
        let fp = self.file_position();
        self.pending_ops.wait_for_all_with_deadline(deadline).await?;

        let cur = self.file_position();
        if fp != cur {
            // Some other request already cycled the buffer holding our
            // record; its write has drained, so at most a flush is owed.
            if self.flush_position() < cur {
                self.do_flush(cur).await?;
            }
            return Ok(());
        }

        // At most one such sync runs; later allocations block on the pending
        // queue until it completes, so abandoning the wait on timeout is safe.
        self.awaited_sync(deadline).await
    }

    /// Runs `sync` as a task and bounds the wait; the sync itself keeps
    /// running past the deadline so abandoned waiters cannot tear it down.
    async fn awaited_sync(self: &Arc<Self>, deadline: Instant) -> CommitlogResult<()> {
        let segment = Arc::clone(self);
        let task = tokio::spawn(async move { segment.sync().await });
        match tokio::time::timeout_at(deadline, task).await {
            Ok(joined) => joined.map_err(|e| CommitlogError::internal(e))?,
            Err(_) => Err(CommitlogError::Timeout),
        }
    }

    /// Writes a zero chunk header when retiring a reusable file before its
    /// physical end, so replay stops cleanly instead of reading stale data.
    pub(crate) async fn terminate(self: &Arc<Self>) -> CommitlogResult<()> {
        debug_assert!(self.is_closed());
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let max_size = self.manager()?.max_size();
            if self.file_position() < max_size {
                trace!(segment = %self.name(), "closed but not terminated");
                return self.cycle(true, true).await;
            }
        }
        Ok(())
    }

    /// Marks the segment non-writable and forces the final
    /// cycle/flush/termination sequence. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>) -> CommitlogResult<()> {
        self.closed.store(true, Ordering::Release);
        self.sync().await?;
        self.flush().await?;
        self.terminate().await
    }

    /// Shutdown: close, wait out every queued op, then trim the file to its
    /// durable length.
    pub(crate) async fn shutdown(self: &Arc<Self>) -> CommitlogResult<()> {
        let close_result = self.close().await;
        self.pending_ops.wait_for_all().await;

        let file = Arc::clone(&self.file);
        let flush_pos = self.flush_position();
        tokio::task::spawn_blocking(move || file.set_len(flush_pos))
            .await
            .map_err(|e| CommitlogError::internal(e))??;
        close_result
    }
}

impl DirtyTracker for Segment {
    fn release_owner_count(&self, owner: OwnerId) {
        self.mark_clean(owner, 1);
        if self.can_delete() {
            if let Some(mgr) = self.manager.upgrade() {
                mgr.discard_unused_segments();
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let Some(mgr) = self.manager.upgrade() else {
            return;
        };
        // Do not hold our own lock while re-entering the manager.
        let clean = self.state.lock().dirty.is_empty();
        if clean {
            debug!(segment = %self.name(), "segment no longer active, submitting for delete");
            mgr.totals().segments_destroyed.fetch_add(1, Ordering::Relaxed);
            mgr.totals()
                .active_size_on_disk
                .fetch_sub(self.file_pos.load(Ordering::Acquire), Ordering::Relaxed);
            mgr.add_file_to_delete(self.path.clone(), self.desc.clone());
        } else {
            tracing::warn!(segment = %self.name(), "dirty segment left on disk");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_segment(id: u64) -> Arc<Segment> {
        let desc = Descriptor::new(id, "CommitLog-");
        let path = PathBuf::from(desc.filename());
        let file = tempfile::tempfile().unwrap();
        Segment::new(Weak::new(), desc, path, file)
    }

    #[test]
    fn contains_requires_matching_id_and_written_offset() {
        let segment = stub_segment(7);
        segment.state.lock().file_pos = 2 * ALIGNMENT as u64;

        assert!(segment.contains(ReplayPosition::new(7, 0)));
        assert!(segment.contains(ReplayPosition::new(7, ALIGNMENT as u32)));
        assert!(!segment.contains(ReplayPosition::new(7, 2 * ALIGNMENT as u32)));
        assert!(!segment.contains(ReplayPosition::new(8, 0)));
    }

    #[test]
    fn fresh_segment_contains_nothing() {
        let segment = stub_segment(3);
        assert!(!segment.contains(ReplayPosition::new(3, 0)));
    }
}
