use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::time::{Duration, Instant};

use commitlog::{
    read_log_file, Commitlog, CommitlogConfig, CommitlogError, OwnerId, ReplayPosition, RpSet,
    SegmentReplayer, SyncMode, DEFAULT_FILENAME_PREFIX,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(dir: &TempDir, mode: SyncMode) -> CommitlogConfig {
    CommitlogConfig {
        directory: dir.path().to_path_buf(),
        segment_size_mb: 1,
        total_space_mb: 8,
        mode,
        max_reserve_segments: 2,
        ..Default::default()
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

fn dir_usage(dir: &TempDir) -> u64 {
    std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
        .sum()
}

async fn replay_all(path: &PathBuf) -> (Vec<Vec<u8>>, Option<CommitlogError>) {
    let mut replayer = SegmentReplayer::open(path, DEFAULT_FILENAME_PREFIX, 0)
        .await
        .unwrap();
    let mut entries = Vec::new();
    loop {
        match replayer.next().await {
            Ok(Some((payload, _rp))) => entries.push(payload),
            Ok(None) => return (entries, None),
            Err(err) => return (entries, Some(err)),
        }
    }
}

#[tokio::test]
async fn create_and_shutdown() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();
    assert!(log.segments_to_replay().is_empty());
    log.shutdown().await;

    let err = log.add_entry(OwnerId(1), b"late", deadline()).await;
    assert!(matches!(err, Err(CommitlogError::Shutdown)));
}

#[tokio::test]
async fn positions_are_monotonic() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let mut last = ReplayPosition::default();
    for i in 0..100u32 {
        let payload = i.to_be_bytes();
        let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
        let rp = handle.rp();
        assert!(rp > last, "{rp} not after {last}");
        last = rp;
        drop(handle);
    }
    log.shutdown().await;
}

#[tokio::test]
async fn batch_mode_data_is_replayable_before_shutdown() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();

    let handle = log
        .add_entry(OwnerId(1), b"tis but a scratch", deadline())
        .await
        .unwrap();

    // Batch mode: once add returned, the bytes are on disk and replayable
    // even though the log is still live.
    let names = log.active_segment_names();
    assert_eq!(names.len(), 1);
    let (entries, err) = replay_all(&names[0]).await;
    assert!(err.is_none());
    assert_eq!(entries, vec![b"tis but a scratch".to_vec()]);

    drop(handle);
    log.shutdown().await;
}

#[tokio::test]
async fn periodic_mode_is_replayable_after_sync() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10u32 {
        let payload = format!("entry-{i}").into_bytes();
        handles.push(log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap());
    }
    log.sync_all_segments().await.unwrap();

    let names = log.active_segment_names();
    assert_eq!(names.len(), 1);
    let (entries, err) = replay_all(&names[0]).await;
    assert!(err.is_none());
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[3], b"entry-3");

    drop(handles);
    log.shutdown().await;
}

#[tokio::test]
async fn filling_a_segment_rolls_over_to_a_new_one() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let payload = vec![0xabu8; 64 * 1024];
    let mut handles = Vec::new();
    let mut first_id = None;
    let mut saw_rollover = false;
    // More than two segments worth of data.
    for _ in 0..40 {
        let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
        let id = handle.rp().id;
        match first_id {
            None => first_id = Some(id),
            Some(first) => saw_rollover |= id > first,
        }
        handles.push(handle);
    }
    assert!(saw_rollover, "expected at least one segment rollover");
    assert!(log.metrics().segments_created >= 2);

    drop(handles);
    log.shutdown().await;
}

#[tokio::test]
async fn record_at_the_limit_is_accepted() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let payload = vec![1u8; log.max_record_size() as usize];
    let handle = log.add_entry(OwnerId(1), &payload, deadline()).await;
    assert!(handle.is_ok());

    drop(handle);
    log.shutdown().await;
}

#[tokio::test]
async fn record_over_the_limit_is_rejected() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let payload = vec![1u8; log.max_record_size() as usize + 1];
    let err = log.add_entry(OwnerId(1), &payload, deadline()).await;
    assert!(matches!(err, Err(CommitlogError::RecordTooLarge { .. })));
    log.shutdown().await;
}

#[tokio::test]
async fn discarding_completed_segments_releases_them() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let payload = vec![7u8; 100 * 1024];
    let mut set = RpSet::new();
    for _ in 0..30 {
        let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
        set.put(handle);
    }
    log.sync_all_segments().await.unwrap();
    assert!(log.num_dirty_segments() > 0);

    log.discard_completed_segments(OwnerId(1), &set);
    assert_eq!(log.num_dirty_segments(), 0);
    assert!(log.metrics().segments_destroyed >= 1);

    log.shutdown().await;
}

#[tokio::test]
async fn discarding_the_same_set_twice_is_idempotent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    // Two owners interleaved across several segments.
    let payload = vec![5u8; 100 * 1024];
    let mut set = RpSet::new();
    let mut other = Vec::new();
    for i in 0..30 {
        if i % 2 == 0 {
            set.put(log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap());
        } else {
            other.push(log.add_entry(OwnerId(2), &payload, deadline()).await.unwrap());
        }
    }
    log.sync_all_segments().await.unwrap();
    assert!(log.num_dirty_segments() > 0);

    log.discard_completed_segments(OwnerId(1), &set);
    let dirty = log.num_dirty_segments();
    assert!(dirty > 0, "the other owner's records must keep segments dirty");

    // Replaying the same set must be a no-op: it may not eat into the other
    // owner's counts or drive any count below zero.
    log.discard_completed_segments(OwnerId(1), &set);
    log.discard_completed_segments(OwnerId(1), &set);
    assert_eq!(log.num_dirty_segments(), dirty);

    drop(other);
    assert_eq!(log.num_dirty_segments(), 0);

    log.shutdown().await;
}

#[tokio::test]
async fn dropping_every_handle_makes_segments_deletable() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();

    let payload = vec![3u8; 100 * 1024];
    let mut handles = Vec::new();
    for _ in 0..30 {
        handles.push(log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap());
    }
    log.sync_all_segments().await.unwrap();

    // Dropping a handle marks its record clean immediately.
    drop(handles);
    assert_eq!(log.num_dirty_segments(), 0);

    log.shutdown().await;
}

#[tokio::test]
async fn replay_resumes_across_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
            .await
            .unwrap();
        for i in 0..5u32 {
            let payload = format!("persisted-{i}").into_bytes();
            let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
            // Keep the segment dirty so shutdown leaves it on disk.
            std::mem::forget(handle);
        }
        log.shutdown().await;
    }

    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();
    let to_replay = log.segments_to_replay();
    assert_eq!(to_replay.len(), 1);

    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    let delivered = read_log_file(&to_replay[0], DEFAULT_FILENAME_PREFIX, 0, move |payload, rp| {
        let i = counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(payload, format!("persisted-{i}").into_bytes());
        assert!(rp.pos > 0);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(delivered, 5);

    log.shutdown().await;
}

#[tokio::test]
async fn new_ids_stay_above_replayed_segments() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let old_id;
    {
        let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
            .await
            .unwrap();
        let handle = log.add_entry(OwnerId(1), b"old", deadline()).await.unwrap();
        old_id = handle.rp().id;
        std::mem::forget(handle);
        log.shutdown().await;
    }

    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();
    let handle = log.add_entry(OwnerId(1), b"new", deadline()).await.unwrap();
    assert!(handle.rp().id > old_id);
    drop(handle);
    log.shutdown().await;
}

#[tokio::test]
async fn corrupt_entry_is_contained_to_its_chunk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path;
    {
        let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
            .await
            .unwrap();
        // Batch mode: each add lands in its own aligned chunk.
        for i in 0..3u32 {
            let payload = format!("chunked-{i}").into_bytes();
            let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
            std::mem::forget(handle);
        }
        path = log.active_segment_names()[0].clone();
        log.shutdown().await;
    }

    // Flip one payload byte of the second entry. Its chunk starts at the
    // first alignment boundary; the entry header is 12 bytes in.
    let mut raw = std::fs::read(&path).unwrap();
    let victim = 4096 + 8 + 12 + 2;
    raw[victim] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    let (entries, err) = replay_all(&path).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], b"chunked-0");
    assert_eq!(entries[1], b"chunked-2");
    assert!(matches!(err, Some(CommitlogError::DataCorruption { bytes }) if bytes > 0));
}

#[tokio::test]
async fn corrupt_chunk_header_stops_replay() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path;
    {
        let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
            .await
            .unwrap();
        for i in 0..3u32 {
            let payload = format!("chunked-{i}").into_bytes();
            let handle = log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap();
            std::mem::forget(handle);
        }
        path = log.active_segment_names()[0].clone();
        log.shutdown().await;
    }

    // Damage the second chunk's header; everything from there on is lost.
    let mut raw = std::fs::read(&path).unwrap();
    raw[4096 + 1] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    let (entries, err) = replay_all(&path).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0], b"chunked-0");
    assert!(matches!(err, Some(CommitlogError::DataCorruption { bytes }) if bytes > 0));
}

#[tokio::test]
async fn unwritten_segment_replays_as_empty() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("CommitLog-2-42.log");
    std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();

    let (entries, err) = replay_all(&path).await;
    assert!(entries.is_empty());
    assert!(err.is_none());
}

#[tokio::test]
async fn foreign_files_are_ignored_at_startup() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
    std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

    let log = Commitlog::create(test_config(&dir, SyncMode::Periodic))
        .await
        .unwrap();
    assert!(log.segments_to_replay().is_empty());
    log.shutdown().await;
}

#[tokio::test]
async fn counters_track_activity() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();

    for _ in 0..4 {
        let handle = log.add_entry(OwnerId(1), b"counted", deadline()).await.unwrap();
        drop(handle);
    }

    let m = log.metrics();
    assert_eq!(m.allocation_count, 4);
    assert!(m.cycle_count >= 4);
    assert!(m.flush_count >= 1);
    assert!(m.bytes_written >= 4 * 4096);
    assert!(m.segments_created >= 1);

    log.shutdown().await;
}

#[tokio::test]
async fn clear_removes_all_segment_files() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();
    let handle = log.add_entry(OwnerId(1), b"doomed", deadline()).await.unwrap();
    std::mem::forget(handle);

    log.clear().await;
    let remaining = log.list_existing_segments().await.unwrap();
    assert!(remaining.is_empty(), "left behind: {remaining:?}");
}

#[tokio::test]
async fn flush_handler_is_invoked_under_disk_pressure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir, SyncMode::Periodic);
    cfg.sync_period_ms = 50;
    cfg.total_space_mb = 2;
    let log = Commitlog::create(cfg).await.unwrap();

    let flushed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&flushed);
    let anchor = log.add_flush_handler(Arc::new(move |_owner, _rp| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    // Fill past the disk-usage threshold while keeping everything dirty.
    let payload = vec![9u8; 100 * 1024];
    let mut handles = Vec::new();
    for _ in 0..18 {
        handles.push(log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap());
    }
    log.sync_all_segments().await.unwrap();

    // Wait for the timer to notice.
    let waited = Instant::now() + Duration::from_secs(10);
    while flushed.load(Ordering::SeqCst) == 0 && Instant::now() < waited {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(flushed.load(Ordering::SeqCst) > 0, "flush handler never fired");

    drop(anchor);
    drop(handles);
    log.shutdown().await;
}

#[tokio::test]
async fn disk_usage_stays_within_the_budget_across_rollovers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir, SyncMode::Periodic);
    cfg.total_space_mb = 4;
    cfg.sync_period_ms = 50;
    let log = Commitlog::create(cfg).await.unwrap();

    let budget = 4 * 1024 * 1024u64;
    let segment_size = 1024 * 1024u64;
    let payload = vec![6u8; 100 * 1024];

    // Write a dozen segments worth of data, releasing each batch once durable
    // the way a well-behaved owner does. Deletions and recycling run in the
    // background, so give the footprint a moment to settle each round; it must
    // never stay above the cap plus the segment currently being filled.
    for round in 0..12 {
        let mut set = RpSet::new();
        for _ in 0..10 {
            set.put(log.add_entry(OwnerId(1), &payload, deadline()).await.unwrap());
        }
        log.sync_all_segments().await.unwrap();
        log.discard_completed_segments(OwnerId(1), &set);

        let waited = Instant::now() + Duration::from_secs(10);
        loop {
            let usage = dir_usage(&dir);
            if usage <= budget + segment_size {
                break;
            }
            assert!(
                Instant::now() < waited,
                "round {round}: disk usage stuck at {usage} bytes"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    assert!(log.metrics().segments_created >= 12);

    log.shutdown().await;
}

#[tokio::test]
async fn missed_batch_deadline_does_not_retire_the_segment() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = Commitlog::create(test_config(&dir, SyncMode::Batch))
        .await
        .unwrap();

    let first = log.add_entry(OwnerId(1), b"on time", deadline()).await.unwrap();

    // An already-expired deadline times out the durability wait; the write
    // itself keeps going in the background.
    let late = log.add_entry(OwnerId(1), b"late", Instant::now()).await;
    assert!(matches!(late, Err(CommitlogError::Timeout)));

    // The segment must still accept writes: no rollover to a new id.
    let second = log.add_entry(OwnerId(1), b"still here", deadline()).await.unwrap();
    assert_eq!(
        second.rp().id,
        first.rp().id,
        "segment was retired after a deadline miss"
    );

    let path = log.active_segment_names()[0].clone();
    std::mem::forget(first);
    std::mem::forget(second);
    log.shutdown().await;

    // The timed-out record reached the log too, in order.
    let (entries, err) = replay_all(&path).await;
    assert!(err.is_none());
    assert_eq!(
        entries,
        vec![b"on time".to_vec(), b"late".to_vec(), b"still here".to_vec()]
    );
}
