//! Ordered pending-operation registry keyed by replay position.
//!
//! Every disk write a segment issues registers itself here before it starts.
//! A flush at position P must not report success until every registered
//! operation at a position <= P has completed, whether it succeeded or failed.
//! Waiting never takes a global lock across the I/O itself; waiters poll the
//! earliest live entry's completion channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{CommitlogError, CommitlogResult};
use crate::position::ReplayPosition;

#[derive(Default)]
pub(crate) struct FlushQueue {
    // Multiple operations may share a position (a cycle and a later flush
    // probe), hence the Vec.
    inner: Arc<Mutex<BTreeMap<ReplayPosition, Vec<watch::Receiver<bool>>>>>,
}

/// Guard for one registered operation. Completion is signalled on `complete()`
/// or on drop, so a failed write still unblocks its waiters.
pub(crate) struct PendingOp {
    inner: Arc<Mutex<BTreeMap<ReplayPosition, Vec<watch::Receiver<bool>>>>>,
    rp: ReplayPosition,
    tx: Option<watch::Sender<bool>>,
}

impl PendingOp {
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let probe = tx.subscribe();
        let _ = tx.send(true);
        let mut map = self.inner.lock();
        if let Some(entries) = map.get_mut(&self.rp) {
            entries.retain(|rx| !rx.same_channel(&probe));
            if entries.is_empty() {
                map.remove(&self.rp);
            }
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.finish();
    }
}

impl FlushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rp: ReplayPosition) -> PendingOp {
        let (tx, rx) = watch::channel(false);
        self.inner.lock().entry(rp).or_default().push(rx);
        PendingOp {
            inner: self.inner.clone(),
            rp,
            tx: Some(tx),
        }
    }

    fn first_pending_upto(&self, bound: ReplayPosition) -> Option<watch::Receiver<bool>> {
        let map = self.inner.lock();
        map.range(..=bound)
            .find_map(|(_, entries)| entries.first().cloned())
    }

    /// Waits until every operation registered at a position <= `bound` has
    /// completed.
    pub async fn wait_for_pending_upto(&self, bound: ReplayPosition) {
        while let Some(mut rx) = self.first_pending_upto(bound) {
            // A dropped sender counts as completion; the guard signalled on
            // the way out.
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    pub async fn wait_for_all(&self) {
        self.wait_for_pending_upto(ReplayPosition::new(u64::MAX, u32::MAX))
            .await;
    }

    pub async fn wait_for_all_with_deadline(&self, deadline: Instant) -> CommitlogResult<()> {
        tokio::time::timeout_at(deadline, self.wait_for_all())
            .await
            .map_err(|_| CommitlogError::Timeout)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_block_until_completion() {
        let queue = Arc::new(FlushQueue::new());
        let op = queue.register(ReplayPosition::new(1, 0));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_for_pending_upto(ReplayPosition::new(1, 10)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        op.complete();
        waiter.await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn later_positions_do_not_block_earlier_waits() {
        let queue = FlushQueue::new();
        let _later = queue.register(ReplayPosition::new(2, 0));
        // Nothing at or below the bound, so this returns immediately.
        queue.wait_for_pending_upto(ReplayPosition::new(1, u32::MAX)).await;
    }

    #[tokio::test]
    async fn dropping_the_guard_counts_as_completion() {
        let queue = FlushQueue::new();
        let op = queue.register(ReplayPosition::new(1, 0));
        drop(op);
        queue.wait_for_all().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn duplicate_positions_are_tracked_independently() {
        let queue = Arc::new(FlushQueue::new());
        let a = queue.register(ReplayPosition::new(1, 4096));
        let b = queue.register(ReplayPosition::new(1, 4096));
        a.complete();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        b.complete();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_expires_with_timeout_error() {
        let queue = FlushQueue::new();
        let _op = queue.register(ReplayPosition::new(1, 0));
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = queue.wait_for_all_with_deadline(deadline).await.unwrap_err();
        assert!(matches!(err, CommitlogError::Timeout));
    }
}
