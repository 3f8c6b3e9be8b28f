//! Ingress batch formation
//!
//! Accumulates submitted frames into batches and hands them downstream. A
//! batch leaves the forming slot when it fills or when the flush task finds
//! it older than the flush interval. Backpressure comes from the bounded
//! ready queue: while it is full, `add` waits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use crate::queue::{BoundedQueue, TrySendError};

pub struct BatchBuffer {
    forming: Mutex<Option<Batch>>,
    /// One flushed-but-unplaced batch, always older than `forming`. Every
    /// mover takes this lock first and drains the slot before touching the
    /// forming batch, so batches enter the ready queue in formation order
    /// and none is ever dropped to make room.
    pending: Mutex<Option<Batch>>,
    next_batch_id: AtomicU64,
    ready: BoundedQueue<Batch>,
    flush_interval: Duration,
    running: AtomicBool,
    stop_notify: Notify,
    flush_task: Mutex<Option<JoinHandle<()>>>,

    frames_received: AtomicU64,
    batches_formed: AtomicU64,
}

impl BatchBuffer {
    pub fn new(flush_interval: Duration, ready_batch_cap: usize) -> Self {
        Self {
            forming: Mutex::new(None),
            pending: Mutex::new(None),
            next_batch_id: AtomicU64::new(1),
            ready: BoundedQueue::new(ready_batch_cap),
            flush_interval,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            flush_task: Mutex::new(None),
            frames_received: AtomicU64::new(0),
            batches_formed: AtomicU64::new(0),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffer = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let stop = buffer.stop_notify.notified();
                tokio::pin!(stop);
                // Register before checking the flag so a stop between ticks
                // cannot slip through unobserved.
                stop.as_mut().enable();
                if !buffer.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        if !buffer.running.load(Ordering::SeqCst) {
                            break;
                        }
                        buffer.flush_if_stale();
                    }
                    _ = &mut stop => break,
                }
            }
        });
        *self.flush_task.lock() = Some(handle);
        info!(
            flush_ms = self.flush_interval.as_millis() as u64,
            ready_cap = self.ready.capacity(),
            "Batch buffer started"
        );
    }

    /// Appends a frame to the forming batch, waiting while the ready queue
    /// is at capacity. A batch that fills up moves to the ready queue and a
    /// fresh one is allocated lazily on the next call.
    ///
    /// Cancellation-safe: the only await is the backpressure gate, taken
    /// before the frame is committed anywhere. A caller that abandons the
    /// future at its deadline loses only its own unaccepted frame.
    pub async fn add(&self, mut frame: Frame) -> Result<()> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(PipelineError::Stopped);
            }
            if !self.ready.wait_not_full().await {
                return Err(PipelineError::Stopped);
            }

            // The pending lock is held for the whole critical section, so no
            // other mover can reorder batches or park a second one.
            let mut pending = self.pending.lock();
            if let Some(parked) = pending.take() {
                if let Some(parked) = self.offer_ready(parked) {
                    // Still no room; back to the gate.
                    *pending = Some(parked);
                    continue;
                }
            }

            let mut forming = self.forming.lock();
            let forming_is_full = forming.as_ref().map_or(false, |batch| batch.is_full());
            let full_forming = if forming_is_full { forming.take() } else { None };
            if let Some(full) = full_forming {
                // A full batch is still waiting for room; it goes out before
                // this frame can start a new one.
                if let Some(full) = self.offer_ready(full) {
                    *forming = Some(full);
                    continue;
                }
            }

            let batch = forming.get_or_insert_with(|| {
                Batch::new(self.next_batch_id.fetch_add(1, Ordering::SeqCst))
            });
            match batch.push(frame) {
                Ok(()) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    if batch.is_full() {
                        if let Some(full) = forming.take() {
                            if let Some(full) = self.offer_ready(full) {
                                // No room right now; the batch stays in the
                                // forming slot until a mover finds room.
                                *forming = Some(full);
                            }
                        }
                    }
                    return Ok(());
                }
                Err(rejected) => {
                    frame = rejected;
                    continue;
                }
            }
        }
    }

    /// Attempts to place one batch into the ready queue. Hands the batch
    /// back when the queue is full; a shut-down queue discards it with a
    /// log.
    fn offer_ready(&self, batch: Batch) -> Option<Batch> {
        match self.ready.try_send(batch) {
            Ok(()) => {
                self.batches_formed.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(TrySendError::Full(batch)) => Some(batch),
            Err(TrySendError::Closed(batch)) => {
                warn!(batch_id = batch.batch_id, "Batch discarded: buffer stopped");
                None
            }
        }
    }

    /// Blocks until a batch is ready. Returns `None` once the buffer is
    /// stopped and drained.
    pub async fn take(&self) -> Option<Batch> {
        self.ready.recv().await
    }

    /// Moves a non-empty forming batch to the ready queue even if not full.
    /// Parked (with a log) when the ready queue has no room; a parked batch
    /// goes out ahead of everything else once room appears.
    pub fn flush_current(&self) {
        self.flush_forming(false);
    }

    fn flush_if_stale(&self) {
        self.flush_forming(true);
    }

    fn flush_forming(&self, only_if_stale: bool) {
        let mut pending = self.pending.lock();
        if let Some(parked) = pending.take() {
            if let Some(parked) = self.offer_ready(parked) {
                // The parked batch is older; nothing may overtake it.
                *pending = Some(parked);
                return;
            }
        }

        let batch = {
            let mut forming = self.forming.lock();
            let flushable = forming.as_ref().map_or(false, |batch| {
                !batch.is_empty() && (!only_if_stale || batch.age() >= self.flush_interval)
            });
            if flushable {
                forming.take()
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            debug!(
                batch_id = batch.batch_id,
                frames = batch.len(),
                age_ms = batch.age().as_millis() as u64,
                "Flushing batch"
            );
            if let Some(batch) = self.offer_ready(batch) {
                // The pending slot is empty here: it was drained above and
                // its lock is still held.
                debug!(batch_id = batch.batch_id, "Ready queue full, flush parked");
                *pending = Some(batch);
            }
        }
    }

    /// Stops the buffer: flushes the forming batch, shuts the ready queue
    /// down (waking blocked `add`/`take` callers), and joins the flush task.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        self.flush_current();
        self.ready.shutdown();
        if let Some(batch) = self.pending.lock().take() {
            warn!(batch_id = batch.batch_id, "Batch discarded: buffer stopped");
        }
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(
            frames = self.frames_received.load(Ordering::Relaxed),
            batches = self.batches_formed.load(Ordering::Relaxed),
            "Batch buffer stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn forming_len(&self) -> usize {
        self.forming.lock().as_ref().map_or(0, |batch| batch.len())
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn batches_formed(&self) -> u64 {
        self.batches_formed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BATCH_CAPACITY;
    use crate::frame::ImageBuffer;

    fn frame(id: u64) -> Frame {
        Frame::new(id, ImageBuffer::new(4, 4, 3))
    }

    #[tokio::test]
    async fn test_full_batch_moves_to_ready_in_order() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_secs(60), 4));
        buffer.start();
        for id in 0..BATCH_CAPACITY as u64 {
            buffer.add(frame(id)).await.unwrap();
        }
        let batch = buffer.take().await.unwrap();
        assert_eq!(batch.len(), BATCH_CAPACITY);
        let ids: Vec<u64> = batch.frames.iter().map(|f| f.frame_id).collect();
        let expected: Vec<u64> = (0..BATCH_CAPACITY as u64).collect();
        assert_eq!(ids, expected, "frames keep acceptance order");
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_flush_timer_flushes_partial_batch() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_millis(30), 4));
        buffer.start();
        buffer.add(frame(0)).await.unwrap();
        buffer.add(frame(1)).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(2), buffer.take())
            .await
            .expect("partial batch must be flushed by the timer")
            .unwrap();
        assert_eq!(batch.len(), 2);
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_backpressure_blocks_add() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_secs(60), 1));
        buffer.start();
        // Fill one ready batch and one forming batch.
        for id in 0..(2 * BATCH_CAPACITY) as u64 {
            buffer.add(frame(id)).await.unwrap();
        }
        // The add completing the next batch has nowhere to put it.
        let blocked = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for id in 0..BATCH_CAPACITY as u64 {
                    buffer.add(frame(1000 + id)).await?;
                }
                Ok::<(), PipelineError>(())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "add must block while ready is full");

        // Draining unblocks it.
        let _first = buffer.take().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("add must resume after a take")
            .unwrap()
            .unwrap();
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_wakes_blocked_callers() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_secs(60), 1));
        buffer.start();
        let taker = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.stop().await;
        let got = tokio::time::timeout(Duration::from_secs(2), taker)
            .await
            .expect("take must wake on stop")
            .unwrap();
        assert!(got.is_none());
        assert!(matches!(
            buffer.add(frame(0)).await,
            Err(PipelineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_parked_flush_drops_nothing_and_keeps_order() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_secs(60), 1));
        buffer.start();

        for id in 0..3u64 {
            buffer.add(frame(id)).await.unwrap();
        }
        // Occupy the single ready slot so the flush has no room.
        assert!(buffer.ready.try_send(Batch::new(1000)).is_ok());
        buffer.flush_current();
        assert_eq!(buffer.forming_len(), 0, "flush takes the forming batch");

        // Room appears; the next add must move the parked batch out before
        // anything newer.
        let occupant = buffer.take().await.unwrap();
        assert_eq!(occupant.batch_id, 1000);
        buffer.add(frame(50)).await.unwrap();

        let parked = buffer.take().await.unwrap();
        let ids: Vec<u64> = parked.frames.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![0, 1, 2], "parked frames all survive, in order");
        assert_eq!(buffer.forming_len(), 1, "the new frame started a fresh batch");

        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_every_frame_in_exactly_one_batch() {
        let buffer = Arc::new(BatchBuffer::new(Duration::from_millis(20), 8));
        buffer.start();
        let total = 100u64;
        for id in 0..total {
            buffer.add(frame(id)).await.unwrap();
        }
        buffer.flush_current();

        let mut seen = Vec::new();
        while seen.len() < total as usize {
            let batch = tokio::time::timeout(Duration::from_secs(2), buffer.take())
                .await
                .expect("all submitted frames must surface")
                .unwrap();
            assert!(!batch.is_empty() && batch.len() <= BATCH_CAPACITY);
            seen.extend(batch.frames.iter().map(|f| f.frame_id));
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), total as usize, "no frame duplicated or lost");
        buffer.stop().await;
    }
}
