//! Replay positions and the RAII commit token.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Number of high bits of a segment id reserved for the owning shard, so
/// replay positions produced by different shards never collide.
pub const SHARD_BITS: u32 = 10;

const BASE_BITS: u32 = 64 - SHARD_BITS;
const BASE_MASK: u64 = (1 << BASE_BITS) - 1;

/// Maximum shard id representable in a segment id.
pub const MAX_SHARDS: u32 = 1 << SHARD_BITS;

/// Opaque identifier for the logical owner of a record (e.g. a table).
///
/// The commitlog never interprets it; it is used only for dirty-count
/// bookkeeping and discard-on-flush signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered coordinate identifying exactly where in the log a record was
/// written: (segment id, byte offset within segment).
///
/// The default value is reserved as "no position yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplayPosition {
    pub id: u64,
    pub pos: u32,
}

impl ReplayPosition {
    pub fn new(id: u64, pos: u32) -> Self {
        Self { id, pos }
    }

    /// Packs a shard id and a base counter into a segment id.
    pub fn pack_id(shard: u32, base: u64) -> u64 {
        debug_assert!(shard < MAX_SHARDS);
        ((shard as u64) << BASE_BITS) | (base & BASE_MASK)
    }

    pub fn shard_id(&self) -> u32 {
        (self.id >> BASE_BITS) as u32
    }

    pub fn base_id(&self) -> u64 {
        self.id & BASE_MASK
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}, {}}}", self.shard_id(), self.base_id(), self.pos)
    }
}

/// Capability held by a commit token: one decrement of an owner's dirty count
/// on the segment the token refers to.
pub(crate) trait DirtyTracker: Send + Sync {
    fn release_owner_count(&self, owner: OwnerId);
}

/// RAII handle returned for every accepted record.
///
/// Dropping (or explicitly releasing) the handle signals that this record's
/// contribution to the owner's dirty count may be considered clean. The
/// decrement happens exactly once.
#[must_use = "dropping an rp handle immediately marks the record clean"]
pub struct RpHandle {
    tracker: Option<Arc<dyn DirtyTracker>>,
    owner: OwnerId,
    rp: ReplayPosition,
}

impl RpHandle {
    pub(crate) fn new(tracker: Arc<dyn DirtyTracker>, owner: OwnerId, rp: ReplayPosition) -> Self {
        Self {
            tracker: Some(tracker),
            owner,
            rp,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn rp(&self) -> ReplayPosition {
        self.rp
    }

    /// Disarms the handle and returns its replay position. The dirty count is
    /// not decremented; the caller takes over that obligation (see [`RpSet`]).
    pub fn release(mut self) -> ReplayPosition {
        self.tracker = None;
        std::mem::take(&mut self.rp)
    }
}

impl fmt::Debug for RpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpHandle")
            .field("owner", &self.owner)
            .field("rp", &self.rp)
            .finish()
    }
}

impl Drop for RpHandle {
    fn drop(&mut self) {
        if self.rp != ReplayPosition::default() {
            if let Some(tracker) = self.tracker.take() {
                tracker.release_owner_count(self.owner);
            }
        }
    }
}

/// A collection of released replay positions, bucketed per segment id.
///
/// Callers accumulate the handles of records they have persisted elsewhere and
/// hand the set to `discard_completed_segments`, which decrements each
/// segment's dirty count by the recorded amount.
#[derive(Debug, Default)]
pub struct RpSet {
    usage: HashMap<u64, u64>,
}

impl RpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs a handle: the dirty-count obligation moves from the handle into
    /// this set.
    pub fn put(&mut self, handle: RpHandle) {
        let rp = handle.release();
        if rp != ReplayPosition::default() {
            *self.usage.entry(rp.id).or_insert(0) += 1;
        }
    }

    pub fn usage(&self) -> &HashMap<u64, u64> {
        &self.usage
    }

    pub fn len(&self) -> usize {
        self.usage.values().map(|c| *c as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn ordering_is_lexicographic() {
        let a = ReplayPosition::new(1, 100);
        let b = ReplayPosition::new(1, 101);
        let c = ReplayPosition::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn shard_packing_round_trips() {
        let id = ReplayPosition::pack_id(7, 42);
        let rp = ReplayPosition::new(id, 0);
        assert_eq!(rp.shard_id(), 7);
        assert_eq!(rp.base_id(), 42);
    }

    #[test]
    fn shards_never_collide() {
        let a = ReplayPosition::pack_id(1, u64::MAX & BASE_MASK);
        let b = ReplayPosition::pack_id(2, 0);
        assert!(a < b);
    }

    struct Recorder(Mutex<Vec<OwnerId>>);

    impl DirtyTracker for Recorder {
        fn release_owner_count(&self, owner: OwnerId) {
            self.0.lock().push(owner);
        }
    }

    #[test]
    fn drop_releases_exactly_once() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let tracker: Arc<dyn DirtyTracker> = recorder.clone();
        let handle = RpHandle::new(tracker.clone(), OwnerId(9), ReplayPosition::new(3, 16));
        drop(handle);
        assert_eq!(recorder.0.lock().as_slice(), &[OwnerId(9)]);
    }

    #[test]
    fn release_disarms_the_drop_hook() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let tracker: Arc<dyn DirtyTracker> = recorder.clone();
        let handle = RpHandle::new(tracker, OwnerId(9), ReplayPosition::new(3, 16));
        let rp = handle.release();
        assert_eq!(rp, ReplayPosition::new(3, 16));
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn rp_set_counts_per_segment() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let tracker: Arc<dyn DirtyTracker> = recorder.clone();
        let mut set = RpSet::new();
        set.put(RpHandle::new(tracker.clone(), OwnerId(1), ReplayPosition::new(5, 0)));
        set.put(RpHandle::new(tracker.clone(), OwnerId(1), ReplayPosition::new(5, 64)));
        set.put(RpHandle::new(tracker, OwnerId(1), ReplayPosition::new(6, 0)));
        assert_eq!(set.len(), 3);
        assert_eq!(set.usage().get(&5), Some(&2));
        assert_eq!(set.usage().get(&6), Some(&1));
        assert!(recorder.0.lock().is_empty());
    }
}
