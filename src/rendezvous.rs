//! Frame rendezvous
//!
//! Completed frames land here keyed by frame id; callers block on a
//! specific id with a deadline. Reading an id consumes it. A soft cap bounds
//! retention when callers never read: the oldest half (by frame id) is
//! evicted and those ids surface as `NotFound`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::frame::Frame;

/// Outcome of a blocking `wait`.
#[derive(Debug)]
pub enum WaitOutcome {
    Ready(Frame),
    /// The id was already delivered to another caller.
    NotFound,
    Timeout,
    Closed,
}

/// Outcome of a non-blocking `try_get`.
#[derive(Debug)]
pub enum TryOutcome {
    Ready(Frame),
    NotFound,
    Closed,
}

struct RendezvousState {
    results: HashMap<u64, Frame>,
    /// Ids already handed to a caller; a second waiter on the same id gets
    /// `NotFound` instead of hanging until its deadline.
    delivered: HashSet<u64>,
}

pub struct FrameRendezvous {
    state: Mutex<RendezvousState>,
    notify: Notify,
    closed: AtomicBool,
    soft_cap: usize,
    published: AtomicU64,
    evicted: AtomicU64,
    /// Every id below this was evicted unread; waiting on one is futile.
    evicted_before: AtomicU64,
    /// Every id below this was delivered (or trimmed from the delivered
    /// set); ids are monotone, so a watermark stands in for the old entries.
    delivered_before: AtomicU64,
}

impl FrameRendezvous {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                results: HashMap::new(),
                delivered: HashSet::new(),
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            soft_cap: soft_cap.max(2),
            published: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            evicted_before: AtomicU64::new(0),
            delivered_before: AtomicU64::new(0),
        }
    }

    /// Inserts a completed frame and wakes every waiter. A frame id is
    /// published at most once; duplicates are discarded with a log.
    pub fn publish(&self, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(frame_id = frame.frame_id, "Result dropped: rendezvous closed");
            return;
        }
        {
            let mut state = self.state.lock();
            let frame_id = frame.frame_id;
            if state.results.contains_key(&frame_id) || state.delivered.contains(&frame_id) {
                warn!(frame_id, "Duplicate frame id published, ignoring");
                return;
            }
            state.results.insert(frame_id, frame);
            self.published.fetch_add(1, Ordering::Relaxed);
            if state.results.len() > self.soft_cap {
                self.evict_oldest_half(&mut state);
            }
        }
        self.notify.notify_waiters();
    }

    /// Evicts the oldest half of the retained results (by frame id) so an
    /// unread backlog cannot grow without bound.
    fn evict_oldest_half(&self, state: &mut RendezvousState) {
        let mut ids: Vec<u64> = state.results.keys().copied().collect();
        ids.sort_unstable();
        let half = ids.len() / 2;
        for id in &ids[..half] {
            state.results.remove(id);
        }
        if half > 0 {
            self.evicted_before
                .fetch_max(ids[half - 1] + 1, Ordering::SeqCst);
        }
        self.evicted.fetch_add(half as u64, Ordering::Relaxed);
        debug!(evicted = half, retained = state.results.len(), "Evicted stale results");
    }

    /// Records a consumed id. The set is bounded on its own: once it
    /// exceeds the soft cap the oldest half collapses into the
    /// `delivered_before` watermark, so steady draining cannot grow it
    /// without bound.
    fn note_delivered(&self, state: &mut RendezvousState, frame_id: u64) {
        state.delivered.insert(frame_id);
        if state.delivered.len() > self.soft_cap {
            let mut seen: Vec<u64> = state.delivered.iter().copied().collect();
            seen.sort_unstable();
            let half = seen.len() / 2;
            for id in &seen[..half] {
                state.delivered.remove(id);
            }
            if half > 0 {
                self.delivered_before
                    .fetch_max(seen[half - 1] + 1, Ordering::SeqCst);
            }
        }
    }

    /// Blocks until the frame is ready, the deadline passes, or the
    /// rendezvous is shut down. Reading consumes the entry.
    pub async fn wait(&self, frame_id: u64, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish racing with the check
            // cannot be missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.results.remove(&frame_id) {
                    self.note_delivered(&mut state, frame_id);
                    return WaitOutcome::Ready(frame);
                }
                if state.delivered.contains(&frame_id)
                    || frame_id < self.delivered_before.load(Ordering::SeqCst)
                {
                    return WaitOutcome::NotFound;
                }
            }
            if self.is_evicted(frame_id) {
                return WaitOutcome::NotFound;
            }
            if self.closed.load(Ordering::SeqCst) {
                return WaitOutcome::Closed;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return WaitOutcome::Timeout;
            }
        }
    }

    pub fn try_get(&self, frame_id: u64) -> TryOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return TryOutcome::Closed;
        }
        let mut state = self.state.lock();
        match state.results.remove(&frame_id) {
            Some(frame) => {
                self.note_delivered(&mut state, frame_id);
                TryOutcome::Ready(frame)
            }
            None => TryOutcome::NotFound,
        }
    }

    /// Wakes every waiter; subsequent waits return `Closed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.results.clear();
            state.delivered.clear();
        }
        self.notify.notify_waiters();
    }

    /// True when the id fell to the retention policy before being read.
    pub fn is_evicted(&self, frame_id: u64) -> bool {
        frame_id < self.evicted_before.load(Ordering::SeqCst) && !self.was_delivered(frame_id)
    }

    /// True when the id was already consumed by some caller.
    pub fn was_delivered(&self, frame_id: u64) -> bool {
        frame_id < self.delivered_before.load(Ordering::SeqCst)
            || self.state.lock().delivered.contains(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().results.is_empty()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageBuffer;
    use std::sync::Arc;

    fn frame(id: u64) -> Frame {
        Frame::new(id, ImageBuffer::new(4, 4, 3))
    }

    #[tokio::test]
    async fn test_publish_then_wait() {
        let rendezvous = FrameRendezvous::new(100);
        rendezvous.publish(frame(1));
        match rendezvous.wait(1, Duration::from_millis(100)).await {
            WaitOutcome::Ready(f) => assert_eq!(f.frame_id, 1),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_then_publish_wakes() {
        let rendezvous = Arc::new(FrameRendezvous::new(100));
        let waiter = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move { rendezvous.wait(5, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rendezvous.publish(frame(5));
        match waiter.await.unwrap() {
            WaitOutcome::Ready(f) => assert_eq!(f.frame_id, 5),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let rendezvous = FrameRendezvous::new(100);
        let start = std::time::Instant::now();
        assert!(matches!(
            rendezvous.wait(9, Duration::from_millis(50)).await,
            WaitOutcome::Timeout
        ));
        assert!(start.elapsed() >= Duration::from_millis(50));
        // Still retrievable later if it eventually arrives.
        rendezvous.publish(frame(9));
        assert!(matches!(rendezvous.try_get(9), TryOutcome::Ready(_)));
    }

    #[tokio::test]
    async fn test_second_reader_observes_not_found() {
        let rendezvous = FrameRendezvous::new(100);
        rendezvous.publish(frame(3));
        assert!(matches!(
            rendezvous.wait(3, Duration::from_millis(50)).await,
            WaitOutcome::Ready(_)
        ));
        assert!(matches!(
            rendezvous.wait(3, Duration::from_millis(50)).await,
            WaitOutcome::NotFound
        ));
        assert!(matches!(rendezvous.try_get(3), TryOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_duplicate_publish_ignored() {
        let rendezvous = FrameRendezvous::new(100);
        rendezvous.publish(frame(7));
        rendezvous.publish(frame(7));
        assert_eq!(rendezvous.len(), 1);
        assert_eq!(rendezvous.published(), 1);
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest_half() {
        let cap = 10;
        let rendezvous = FrameRendezvous::new(cap);
        for id in 0..=(cap as u64) {
            rendezvous.publish(frame(id));
        }
        // Crossing the cap halves the retained set; the oldest ids go first.
        assert!(rendezvous.len() <= cap);
        assert!(matches!(rendezvous.try_get(0), TryOutcome::NotFound));
        assert!(matches!(rendezvous.try_get(cap as u64), TryOutcome::Ready(_)));
        assert!(rendezvous.evicted() > 0);
    }

    #[tokio::test]
    async fn test_delivered_set_stays_bounded_under_steady_drain() {
        let cap = 10;
        let rendezvous = FrameRendezvous::new(cap);
        // Publish-then-read every frame, the common steady-state pattern:
        // results never pile up, but delivered ids keep accruing.
        for id in 0..(5 * cap as u64) {
            rendezvous.publish(frame(id));
            assert!(matches!(
                rendezvous.wait(id, Duration::from_millis(100)).await,
                WaitOutcome::Ready(_)
            ));
        }
        assert!(
            rendezvous.state.lock().delivered.len() <= cap,
            "delivered set must not outgrow the soft cap"
        );
        // Trimmed ids still answer as consumed via the watermark.
        assert!(rendezvous.was_delivered(0));
        assert!(matches!(
            rendezvous.wait(0, Duration::from_millis(50)).await,
            WaitOutcome::NotFound
        ));
        assert!(matches!(rendezvous.try_get(0), TryOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_closed() {
        let rendezvous = Arc::new(FrameRendezvous::new(100));
        let waiter = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move { rendezvous.wait(42, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rendezvous.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake on shutdown")
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Closed));
        assert!(matches!(
            rendezvous.wait(42, Duration::from_millis(10)).await,
            WaitOutcome::Closed
        ));
    }
}
