//! The segment manager: owns the live segment pool, the pre-allocated
//! reserve, admission control, the disk-space budget and the periodic sync
//! timer, and sequences shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::{CommitlogConfig, SyncMode, ALIGNMENT, DEFAULT_BUFFER_SIZE};
use crate::descriptor::{Descriptor, RECYCLED_PREFIX};
use crate::error::{CommitlogError, CommitlogResult};
use crate::position::{OwnerId, ReplayPosition};
use crate::segment::{AllocateOutcome, Segment, ENTRY_OVERHEAD_SIZE};
use crate::{EntryWriter, RpHandle, RpSet};

/// Callback registered by a consumer (e.g. the storage engine) asking it to
/// persist its in-memory state up to the given position, so segments can be
/// discarded.
pub type FlushHandler = Arc<dyn Fn(OwnerId, ReplayPosition) + Send + Sync>;

pub type FlushHandlerId = u64;

/// Aggregate counters, mirrored into the metrics snapshot.
#[derive(Debug, Default)]
pub(crate) struct Totals {
    pub allocation_count: AtomicU64,
    pub cycle_count: AtomicU64,
    pub flush_count: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_slack: AtomicU64,
    pub segments_created: AtomicU64,
    pub segments_destroyed: AtomicU64,
    pub pending_flushes: AtomicU64,
    pub flush_limit_exceeded: AtomicU64,
    pub requests_blocked_memory: AtomicU64,
    pub buffer_list_bytes: AtomicU64,
    /// Bytes on disk actually containing data (allocate + cycle).
    pub active_size_on_disk: AtomicU64,
    /// Bytes allocated on disk (new, reserve and recycled files).
    pub total_size_on_disk: AtomicU64,
}

/// Point-in-time view of the manager's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitlogMetrics {
    pub allocation_count: u64,
    pub cycle_count: u64,
    pub flush_count: u64,
    pub bytes_written: u64,
    pub bytes_slack: u64,
    pub segments_created: u64,
    pub segments_destroyed: u64,
    pub pending_flushes: u64,
    pub flush_limit_exceeded: u64,
    pub requests_blocked_memory: u64,
    pub buffer_list_bytes: u64,
    pub active_size_on_disk: u64,
    pub total_size_on_disk: u64,
}

impl Totals {
    fn snapshot(&self) -> CommitlogMetrics {
        CommitlogMetrics {
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            cycle_count: self.cycle_count.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_slack: self.bytes_slack.load(Ordering::Relaxed),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            segments_destroyed: self.segments_destroyed.load(Ordering::Relaxed),
            pending_flushes: self.pending_flushes.load(Ordering::Relaxed),
            flush_limit_exceeded: self.flush_limit_exceeded.load(Ordering::Relaxed),
            requests_blocked_memory: self.requests_blocked_memory.load(Ordering::Relaxed),
            buffer_list_bytes: self.buffer_list_bytes.load(Ordering::Relaxed),
            active_size_on_disk: self.active_size_on_disk.load(Ordering::Relaxed),
            total_size_on_disk: self.total_size_on_disk.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn sub_size_on_disk(&self, bytes: u64) {
        let _ = self
            .total_size_on_disk
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// Serializes the count of in-flight flushes behind a semaphore and keeps the
/// pending gauge honest.
pub(crate) struct FlushGuard {
    totals: Arc<Totals>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.totals.pending_flushes.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Small pool of pre-allocated, pre-extended segments so the write path never
/// pays file-extension latency. Replenished by a background task.
struct ReserveQueue {
    state: Mutex<(VecDeque<Arc<Segment>>, usize)>,
    not_empty: Notify,
    not_full: Notify,
}

impl ReserveQueue {
    fn new(max: usize) -> Self {
        Self {
            state: Mutex::new((VecDeque::new(), max)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn push(&self, segment: Arc<Segment>) -> bool {
        let mut state = self.state.lock();
        if state.0.len() >= state.1 {
            return false;
        }
        state.0.push_back(segment);
        drop(state);
        self.not_empty.notify_waiters();
        true
    }

    async fn pop(&self) -> Arc<Segment> {
        loop {
            let notified = self.not_empty.notified();
            if let Some(segment) = self.state.lock().0.pop_front() {
                self.not_full.notify_waiters();
                return segment;
            }
            notified.await;
        }
    }

    async fn wait_not_full(&self) {
        loop {
            let notified = self.not_full.notified();
            {
                let state = self.state.lock();
                if state.0.len() < state.1 {
                    return;
                }
            }
            notified.await;
        }
    }

    fn is_empty(&self) -> bool {
        self.state.lock().0.is_empty()
    }

    fn max(&self) -> usize {
        self.state.lock().1
    }

    fn grow_max(&self) -> usize {
        let mut state = self.state.lock();
        state.1 += 1;
        let max = state.1;
        drop(state);
        self.not_full.notify_waiters();
        max
    }

    fn drain(&self) -> Vec<Arc<Segment>> {
        let mut state = self.state.lock();
        state.0.drain(..).collect()
    }
}

struct ManagerState {
    segments: Vec<Arc<Segment>>,
    recycled: VecDeque<PathBuf>,
    files_to_delete: HashMap<PathBuf, Descriptor>,
    flush_handlers: HashMap<FlushHandlerId, FlushHandler>,
    next_flush_id: FlushHandlerId,
    segments_to_replay: Vec<PathBuf>,
    /// Segments put in use since the last disk-threshold check.
    new_counter: u64,
}

pub(crate) struct SegmentManager {
    cfg: CommitlogConfig,
    max_size: u64,
    max_mutation_size: u64,
    max_disk_size: u64,
    disk_usage_threshold: u64,
    /// Byte-budget semaphore bounding in-flight buffered bytes; the
    /// backpressure point for writers.
    request_controller: Arc<Semaphore>,
    request_units: u64,
    flush_semaphore: Arc<Semaphore>,
    ids: AtomicU64,
    state: Mutex<ManagerState>,
    reserve: ReserveQueue,
    /// Deduplicates concurrent new-segment requests into one in-flight
    /// allocation all waiters observe.
    segment_allocating: Mutex<Option<watch::Receiver<bool>>>,
    shutdown_flag: AtomicBool,
    shutdown_rx: Mutex<Option<watch::Receiver<bool>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    totals: Arc<Totals>,
    /// Weak back-reference so drop paths can spawn follow-up work.
    self_ref: Mutex<Weak<SegmentManager>>,
}

impl SegmentManager {
    pub(crate) fn new(cfg: CommitlogConfig) -> CommitlogResult<Arc<Self>> {
        let cfg = cfg.normalized()?;
        let max_size = cfg.segment_size_bytes();
        let max_mutation_size = max_size / 2;
        let max_disk_size = cfg.total_space_bytes();
        // Threshold for asking owners to flush: max minus half a segment.
        let disk_usage_threshold = max_disk_size - max_size / 2;
        // Enough for our largest mutation plus one in-flight default buffer,
        // so every valid record can always be admitted eventually.
        let request_units = max_mutation_size + DEFAULT_BUFFER_SIZE as u64;

        trace!(directory = %cfg.directory.display(), max_disk_mb = max_disk_size / (1024 * 1024),
            "commitlog manager created");

        let mgr = Arc::new(Self {
            request_controller: Arc::new(Semaphore::new(request_units as usize)),
            request_units,
            flush_semaphore: Arc::new(Semaphore::new(cfg.max_active_flushes as usize)),
            ids: AtomicU64::new(ReplayPosition::pack_id(cfg.shard, 0)),
            state: Mutex::new(ManagerState {
                segments: Vec::new(),
                recycled: VecDeque::new(),
                files_to_delete: HashMap::new(),
                flush_handlers: HashMap::new(),
                next_flush_id: 0,
                segments_to_replay: Vec::new(),
                new_counter: 0,
            }),
            reserve: ReserveQueue::new(1),
            segment_allocating: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
            shutdown_rx: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            totals: Arc::new(Totals::default()),
            self_ref: Mutex::new(Weak::new()),
            max_size,
            max_mutation_size,
            max_disk_size,
            disk_usage_threshold,
            cfg,
        });
        *mgr.self_ref.lock() = Arc::downgrade(&mgr);
        Ok(mgr)
    }

    pub(crate) fn config(&self) -> &CommitlogConfig {
        &self.cfg
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.max_size
    }

    pub(crate) fn max_record_size(&self) -> u64 {
        self.max_mutation_size - ENTRY_OVERHEAD_SIZE as u64
    }

    pub(crate) fn totals(&self) -> &Totals {
        &self.totals
    }

    pub(crate) fn metrics(&self) -> CommitlogMetrics {
        self.totals.snapshot()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn filename(&self, d: &Descriptor) -> PathBuf {
        self.cfg.directory.join(d.filename())
    }

    pub(crate) fn sanity_check_size(&self, size: u64) -> CommitlogResult<()> {
        if size > self.max_mutation_size {
            return Err(CommitlogError::RecordTooLarge {
                size,
                limit: self.max_mutation_size,
            });
        }
        Ok(())
    }

    /// Discovers existing segment files, seeds the id counter above them and
    /// starts the background tasks. Must run before any writes.
    pub(crate) async fn init(self: &Arc<Self>) -> CommitlogResult<()> {
        tokio::fs::create_dir_all(&self.cfg.directory).await?;

        let mut descs = self.list_descriptors(&self.cfg.directory).await?;
        descs.sort_by_key(|d| d.id);

        let mut max_base = 0u64;
        let mut replay = Vec::new();
        for d in &descs {
            max_base = max_base.max(ReplayPosition::new(d.id, 0).base_id());
            let path = self.filename(d);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                self.totals
                    .total_size_on_disk
                    .fetch_add(meta.len(), Ordering::Relaxed);
            }
            replay.push(path);
        }
        self.ids.store(
            ReplayPosition::pack_id(self.cfg.shard, max_base),
            Ordering::Release,
        );
        self.state.lock().segments_to_replay = replay;

        let replenisher = tokio::spawn(Arc::clone(self).replenish_reserve());
        let timer = tokio::spawn(Arc::clone(self).run_timer());
        self.tasks.lock().extend([replenisher, timer]);
        Ok(())
    }

    pub(crate) async fn list_descriptors(&self, dir: &Path) -> CommitlogResult<Vec<Descriptor>> {
        let mut result = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match Descriptor::parse(&name, &self.cfg.fname_prefix) {
                Ok(d) => result.push(d),
                Err(err @ CommitlogError::SegmentTooOld(_)) => warn!(file = %name, %err),
                // Foreign files are simply not ours to replay.
                Err(_) => {}
            }
        }
        Ok(result)
    }

    pub(crate) fn segments_to_replay(&self) -> Vec<PathBuf> {
        self.state.lock().segments_to_replay.clone()
    }

    /// The public write entry point: admission control first, then a segment.
    pub(crate) async fn allocate_when_possible(
        self: &Arc<Self>,
        owner: OwnerId,
        writer: &dyn EntryWriter,
        deadline: Instant,
    ) -> CommitlogResult<RpHandle> {
        // Throw early: a record that can never fit must not reach allocate().
        let total = writer.size() as u64 + ENTRY_OVERHEAD_SIZE as u64;
        self.sanity_check_size(total)?;
        if self.is_shutdown() {
            return Err(CommitlogError::Shutdown);
        }

        let sem = Arc::clone(&self.request_controller);
        let units = total as u32;
        let permit = match Arc::clone(&sem).try_acquire_many_owned(units) {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(CommitlogError::Shutdown),
            Err(TryAcquireError::NoPermits) => {
                self.totals
                    .requests_blocked_memory
                    .fetch_add(1, Ordering::Relaxed);
                tokio::time::timeout_at(deadline, sem.acquire_many_owned(units))
                    .await
                    .map_err(|_| CommitlogError::Timeout)?
                    .map_err(|_| CommitlogError::Shutdown)?
            }
        };

        let mut permit = Some(permit);
        loop {
            let segment = self.active_segment(deadline).await?;
            match segment.allocate(owner, writer, &mut permit, deadline).await? {
                AllocateOutcome::Handle(handle) => return Ok(handle),
                AllocateOutcome::Rollover => continue,
            }
        }
    }

    /// Returns the last segment if it still accepts writes, otherwise joins
    /// (or starts) the single in-flight allocation of a fresh one.
    pub(crate) async fn active_segment(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> CommitlogResult<Arc<Segment>> {
        loop {
            if self.is_shutdown() {
                return Err(CommitlogError::Shutdown);
            }
            {
                let state = self.state.lock();
                if let Some(last) = state.segments.last() {
                    if last.is_still_allocating() {
                        return Ok(Arc::clone(last));
                    }
                }
            }

            let rx = {
                let mut guard = self.segment_allocating.lock();
                match guard.as_ref() {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        *guard = Some(rx.clone());
                        let mgr = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(err) = mgr.new_segment().await {
                                warn!(error = %err, "failed to allocate new segment");
                            }
                            *mgr.segment_allocating.lock() = None;
                            let _ = tx.send(true);
                        });
                        rx
                    }
                }
            };

            let mut rx = rx;
            match tokio::time::timeout_at(deadline, rx.wait_for(|done| *done)).await {
                Ok(_) => continue,
                Err(_) => return Err(CommitlogError::Timeout),
            };
        }
    }

    /// Takes a segment from the reserve into the live pool, growing the
    /// reserve cap when both the pool and the disk budget allow it.
    async fn new_segment(self: &Arc<Self>) -> CommitlogResult<Arc<Segment>> {
        if self.is_shutdown() {
            return Err(CommitlogError::Shutdown);
        }

        self.state.lock().new_counter += 1;

        if self.reserve.is_empty()
            && self.reserve.max() < self.cfg.max_reserve_segments
            && self.totals.total_size_on_disk.load(Ordering::Relaxed) + self.max_size
                <= self.max_disk_size
        {
            let max = self.reserve.grow_max();
            debug!(reserve = max, "increased segment reserve count");
        }

        let segment = tokio::select! {
            segment = self.reserve.pop() => segment,
            _ = self.cancel.cancelled() => return Err(CommitlogError::Shutdown),
        };
        segment.reset_sync_time();
        self.state.lock().segments.push(Arc::clone(&segment));
        Ok(segment)
    }

    async fn replenish_reserve(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.reserve.wait_not_full() => {}
            }
            if self.is_shutdown() {
                return;
            }
            // Always allow a new file even near the budget; flush logic is
            // not guaranteed to free an existing segment in time.
            match self.allocate_segment().await {
                Ok(segment) => {
                    if !self.reserve.push(segment) {
                        error!("segment reserve is full, dropping fresh segment");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "exception in segment reservation");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Creates (or recycles) one pre-extended segment file.
    async fn allocate_segment(self: &Arc<Self>) -> CommitlogResult<Arc<Segment>> {
        let d = Descriptor::new(self.next_id(), &self.cfg.fname_prefix);
        let dst = self.filename(&d);

        let recycled = self.state.lock().recycled.pop_front();
        if let Some(src) = recycled {
            // Rename here, not at recycle time, to keep descriptor id order.
            debug!(from = %src.display(), to = %dst.display(), "using recycled segment file");
            self.rename_file(src, dst.clone()).await?;
            self.open_segment_file(d, dst, false).await
        } else {
            self.open_segment_file(d, dst, true).await
        }
    }

    async fn open_segment_file(
        self: &Arc<Self>,
        d: Descriptor,
        path: PathBuf,
        create: bool,
    ) -> CommitlogResult<Arc<Segment>> {
        let max_size = self.max_size;
        let prezero = self.cfg.use_synchronous_writes;
        let io_path = path.clone();

        let (file, grown) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let file = OpenOptions::new()
                .write(true)
                .create(create)
                .open(&io_path)?;
            let existing = file.metadata()?.len();
            if existing > max_size {
                // Recycled file left slightly larger by a final zeroing.
                file.set_len(max_size)?;
                return Ok((file, 0));
            }
            let grown = max_size - existing;
            if grown == 0 {
                return Ok((file, 0));
            }
            if prezero {
                // With synchronous writes the file must hold real zeros, not
                // holes; extend it by explicit buffer writes.
                let zeros = vec![0u8; 32 * ALIGNMENT];
                let mut off = existing & !(ALIGNMENT as u64 - 1);
                while off < max_size {
                    let n = zeros.len().min((max_size - off) as usize);
                    file.write_all_at(&zeros[..n], off)?;
                    off += n as u64;
                }
            } else {
                file.set_len(max_size)?;
            }
            Ok((file, grown))
        })
        .await
        .map_err(|e| CommitlogError::internal(e))??;

        if grown > 0 {
            self.totals
                .total_size_on_disk
                .fetch_add(grown, Ordering::Relaxed);
        }
        self.totals.segments_created.fetch_add(1, Ordering::Relaxed);
        Ok(Segment::new(Arc::downgrade(self), d, path, file))
    }

    async fn rename_file(&self, from: PathBuf, to: PathBuf) -> CommitlogResult<()> {
        let dir = self.cfg.directory.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::rename(&from, &to)?;
            std::fs::File::open(&dir)?.sync_all()
        })
        .await
        .map_err(|e| CommitlogError::internal(e))??;
        Ok(())
    }

    pub(crate) async fn begin_flush(&self) -> CommitlogResult<FlushGuard> {
        let pending = self.totals.pending_flushes.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.cfg.max_active_flushes {
            self.totals
                .flush_limit_exceeded
                .fetch_add(1, Ordering::Relaxed);
            trace!(pending, "flush ops overflow, will block");
        }
        match Arc::clone(&self.flush_semaphore).acquire_owned().await {
            Ok(permit) => Ok(FlushGuard {
                totals: Arc::clone(&self.totals),
                _permit: permit,
            }),
            Err(_) => {
                self.totals.pending_flushes.fetch_sub(1, Ordering::Relaxed);
                Err(CommitlogError::Shutdown)
            }
        }
    }

    /// Clears `owner`'s dirty counts recorded in `used`, then deletes or
    /// recycles any segment that became unused. Idempotent: counts never go
    /// negative.
    pub(crate) fn discard_completed_segments_set(&self, owner: OwnerId, used: &RpSet) {
        debug!(%owner, positions = used.len(), "discarding");
        {
            let state = self.state.lock();
            for segment in &state.segments {
                if let Some(count) = used.usage().get(&segment.descriptor().id) {
                    segment.mark_clean(owner, *count);
                }
            }
        }
        self.discard_unused_segments();
    }

    /// Drops everything the owner contributed, e.g. when the owning table
    /// itself goes away.
    pub(crate) fn discard_completed_segments(&self, owner: OwnerId) {
        debug!(%owner, "discarding all data");
        {
            let state = self.state.lock();
            for segment in &state.segments {
                segment.mark_clean_owner(owner);
            }
        }
        self.discard_unused_segments();
    }

    /// Removes segments that are clean, flushed and no longer accepting
    /// writes, queueing their files for deletion or recycling.
    pub(crate) fn discard_unused_segments(&self) {
        let mut dropped = Vec::new();
        {
            let mut state = self.state.lock();
            trace!(active = state.segments.len(), "checking for unused segments");
            let mut kept = Vec::with_capacity(state.segments.len());
            for segment in state.segments.drain(..) {
                if segment.can_delete() {
                    debug!(segment = %segment.name(), "segment is unused");
                    dropped.push(segment);
                } else {
                    if segment.is_still_allocating() {
                        trace!(segment = %segment.name(), "still allocating, not deletable");
                    } else if !segment.is_clean() {
                        trace!(segment = %segment.name(), "still dirty, not deletable");
                    } else {
                        trace!(segment = %segment.name(), "disk ops pending, not deletable");
                    }
                    kept.push(segment);
                }
            }
            state.segments = kept;
        }
        // Dropping outside the lock; Segment::drop re-enters the manager to
        // queue its file.
        drop(dropped);

        if !self.is_shutdown() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                if let Some(mgr) = self.upgrade_self() {
                    handle.spawn(async move { mgr.do_pending_deletes().await });
                }
            }
        }
    }

    // Segment::drop and RpHandle::drop reach the manager through a Weak; this
    // recovers an owning handle for spawned follow-up work.
    fn upgrade_self(&self) -> Option<Arc<Self>> {
        self.self_ref.lock().upgrade()
    }

    pub(crate) fn add_file_to_delete(&self, path: PathBuf, d: Descriptor) {
        self.state.lock().files_to_delete.insert(path, d);
    }

    pub(crate) async fn do_pending_deletes(self: &Arc<Self>) {
        let files = {
            let mut state = self.state.lock();
            mem::take(&mut state.files_to_delete)
        };
        self.delete_segments(files.into_keys().collect()).await;
    }

    pub(crate) async fn delete_segments(self: &Arc<Self>, files: Vec<PathBuf>) {
        for path in files {
            let reuse = !self.is_shutdown()
                && self.cfg.reuse_segments
                && self.totals.total_size_on_disk.load(Ordering::Relaxed) <= self.max_disk_size;
            let result = if reuse {
                self.recycle_file(&path).await
            } else {
                self.delete_file(&path).await
            };
            if let Err(err) = result {
                error!(file = %path.display(), error = %err, "could not delete segment");
            }
        }
    }

    /// Renames a retired file for reuse; the name change invalidates the
    /// embedded header id, so a recycled file can never be replayed.
    async fn recycle_file(self: &Arc<Self>, path: &Path) -> CommitlogResult<()> {
        let prefix = format!("{}{}", RECYCLED_PREFIX, self.cfg.fname_prefix);
        let d = Descriptor::new(self.next_id(), &prefix);
        let dst = self.filename(&d);
        debug!(file = %path.display(), "recycling segment file");
        match self.rename_file(path.to_path_buf(), dst.clone()).await {
            Ok(()) => {
                self.state.lock().recycled.push_back(dst);
                Ok(())
            }
            Err(_) => self.delete_file(path).await,
        }
    }

    async fn delete_file(&self, path: &Path) -> CommitlogResult<()> {
        let size = tokio::fs::metadata(path).await?.len();
        debug!(file = %path.display(), "deleting segment file");
        tokio::fs::remove_file(path).await?;
        self.totals.sub_size_on_disk(size);
        Ok(())
    }

    pub(crate) fn add_flush_handler(&self, handler: FlushHandler) -> FlushHandlerId {
        let mut state = self.state.lock();
        state.next_flush_id += 1;
        let id = state.next_flush_id;
        state.flush_handlers.insert(id, handler);
        id
    }

    pub(crate) fn remove_flush_handler(&self, id: FlushHandlerId) {
        self.state.lock().flush_handlers.remove(&id);
    }

    /// Asks every registered flush handler to persist each owner known dirty
    /// in a non-active segment, up to `high`.
    pub(crate) fn flush_segments(&self, force: bool) {
        let (callbacks, high, ids) = {
            let state = self.state.lock();
            let Some(active) = state.segments.last() else {
                return;
            };
            let mut high = ReplayPosition::new(active.descriptor().id, 0);
            // Leave the head of the active segment alone unless forced or it
            // stopped allocating.
            if force || !active.is_still_allocating() {
                high = ReplayPosition::new(high.id + 1, 0);
            }
            let mut ids: HashSet<OwnerId> = HashSet::new();
            for segment in &state.segments[..state.segments.len() - 1] {
                ids.extend(segment.dirty_owners());
            }
            let callbacks: Vec<FlushHandler> = state.flush_handlers.values().cloned().collect();
            (callbacks, high, ids)
        };

        debug!(force, %high, owners = ids.len(), "requesting owner flushes");
        for callback in &callbacks {
            for id in &ids {
                callback(*id, high);
            }
        }
    }

    async fn run_timer(self: Arc<Self>) {
        let period = Duration::from_millis(self.cfg.sync_period_ms);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            if self.cfg.mode != SyncMode::Batch {
                self.sync_in_background();
            }
            // Only bother the owners when a new segment went into use since
            // the last check and we are over the threshold.
            let new_counter = mem::take(&mut self.state.lock().new_counter);
            if new_counter > 0 {
                let cur = self.totals.active_size_on_disk.load(Ordering::Relaxed);
                if self.disk_usage_threshold != 0 && cur >= self.disk_usage_threshold {
                    debug!(used_mb = cur / (1024 * 1024),
                        threshold_mb = self.disk_usage_threshold / (1024 * 1024),
                        "used size on disk exceeds local maximum");
                    self.flush_segments(false);
                } else {
                    self.state.lock().new_counter += new_counter;
                }
            }
            self.do_pending_deletes().await;
        }
    }

    /// Periodic-mode timer sync: fire and forget per segment.
    fn sync_in_background(&self) {
        let segments: Vec<Arc<Segment>> = self.state.lock().segments.clone();
        for segment in segments {
            tokio::spawn(async move {
                if let Err(err) = segment.sync().await {
                    error!(segment = %segment.name(), error = %err, "periodic sync failed");
                }
            });
        }
    }

    pub(crate) async fn sync_all_segments(&self) -> CommitlogResult<()> {
        debug!("issuing sync for all segments");
        let segments: Vec<Arc<Segment>> = self.state.lock().segments.clone();
        let results =
            futures::future::join_all(segments.iter().map(|segment| segment.sync())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn shutdown_all_segments(&self) -> CommitlogResult<()> {
        debug!("issuing shutdown for all segments");
        let segments: Vec<Arc<Segment>> = self.state.lock().segments.clone();
        let results =
            futures::future::join_all(segments.iter().map(|segment| segment.shutdown())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Terminal state: drains in-flight work, closes every segment and clears
    /// the reserve. All concurrent callers observe the same completion.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let rx = {
            let mut guard = self.shutdown_rx.lock();
            match guard.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(false);
                    *guard = Some(rx.clone());
                    let mgr = Arc::clone(self);
                    tokio::spawn(async move {
                        mgr.drive_shutdown().await;
                        let _ = tx.send(true);
                    });
                    rx
                }
            }
        };
        let mut rx = rx;
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn drive_shutdown(self: &Arc<Self>) {
        // New writers are rejected from here on; in-flight ones fail out of
        // their segment wait and release their admission units.
        self.shutdown_flag.store(true, Ordering::Release);
        self.cancel.cancel();

        // Queue the whole-budget acquire: it completes only once every
        // outstanding admission unit came back, i.e. once every buffered
        // record either reached the file or its writer errored out.
        let sem = Arc::clone(&self.request_controller);
        let units = self.request_units as u32;
        let all_units = tokio::spawn(async move { sem.acquire_many_owned(units).await });

        if let Err(err) = self.sync_all_segments().await {
            warn!(error = %err, "sync during shutdown failed");
        }

        let tasks = mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        if let Err(err) = self.shutdown_all_segments().await {
            warn!(error = %err, "segment shutdown failed");
        }

        let permits = all_units.await;
        drop(permits);
        self.request_controller.close();

        self.discard_unused_segments();
        self.clear_reserve_segments().await;
        self.do_pending_deletes().await;
        trace!("commitlog disposed");
    }

    async fn clear_reserve_segments(self: &Arc<Self>) {
        // Reserve segments are clean and empty; dropping them queues their
        // files for deletion.
        drop(self.reserve.drain());

        let recycled = {
            let mut state = self.state.lock();
            mem::take(&mut state.recycled)
        };
        for path in recycled {
            debug!(file = %path.display(), "deleting recycled segment file");
            if let Err(err) = self.delete_file(&path).await {
                warn!(file = %path.display(), error = %err, "failed to delete recycled file");
            }
        }
        self.do_pending_deletes().await;
    }

    /// Forgets every live segment regardless of dirty state and queues its
    /// file for deletion. Queueing is explicit: a leaked commit token may keep
    /// a segment object alive past this point, but its file still has to go.
    pub(crate) fn orphan_all(&self) {
        let segments = {
            let mut state = self.state.lock();
            mem::take(&mut state.segments)
        };
        for segment in &segments {
            segment.mark_clean_all();
            self.add_file_to_delete(segment.path().clone(), segment.descriptor().clone());
        }
        drop(segments);
    }

    /// Test support: shutdown, forget all content, remove every file.
    pub(crate) async fn clear(self: &Arc<Self>) {
        debug!("clearing commitlog");
        self.shutdown().await;
        self.orphan_all();
        self.clear_reserve_segments().await;
        self.do_pending_deletes().await;
    }

    pub(crate) fn active_segment_names(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .filter(|s| !s.is_unused())
            .map(|s| self.cfg.directory.join(s.name()))
            .collect()
    }

    pub(crate) fn num_dirty_segments(&self) -> usize {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .filter(|s| !s.is_still_allocating() && !s.is_clean())
            .count()
    }

    pub(crate) fn num_active_segments(&self) -> usize {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .filter(|s| s.is_still_allocating())
            .count()
    }
}
