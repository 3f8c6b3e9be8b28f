//! Bounded MPMC queue
//!
//! The FIFO channel every stage boundary is built on: fixed capacity,
//! asynchronous blocking send/receive, and shutdown that wakes every waiter.
//! After shutdown, sends fail immediately while receives drain the remaining
//! items before failing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The queue was shut down; the rejected item is handed back.
#[derive(Debug)]
pub struct SendError<T>(pub T);

#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    shutdown: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues `item`, waiting while the queue is at capacity.
    pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
        let mut item = item;
        loop {
            if self.is_shutdown() {
                return Err(SendError(item));
            }
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, otherwise a pop between
            // the check and the await is a lost wakeup.
            notified.as_mut().enable();
            {
                let mut queue = self.inner.lock();
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    drop(queue);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
            item = match self.check_shutdown(item) {
                Ok(item) => item,
                Err(err) => return Err(err),
            };
        }
    }

    fn check_shutdown(&self, item: T) -> Result<T, SendError<T>> {
        if self.is_shutdown() {
            Err(SendError(item))
        } else {
            Ok(item)
        }
    }

    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        if self.is_shutdown() {
            return Err(TrySendError::Closed(item));
        }
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return Err(TrySendError::Full(item));
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the head, waiting while the queue is empty. Returns `None`
    /// once the queue is shut down and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.inner.lock();
                if let Some(item) = queue.pop_front() {
                    drop(queue);
                    self.not_full.notify_one();
                    return Some(item);
                }
            }
            if self.is_shutdown() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut queue = self.inner.lock();
        if let Some(item) = queue.pop_front() {
            drop(queue);
            self.not_full.notify_one();
            return Ok(item);
        }
        drop(queue);
        if self.is_shutdown() {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Waits until the queue has room (or is shut down). Used by the ingress
    /// gate to apply backpressure before committing a frame.
    pub async fn wait_not_full(&self) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().len() < self.capacity {
                return true;
            }
            notified.await;
        }
    }

    /// Idempotent. Wakes every blocked sender and receiver; sends fail from
    /// here on, receives drain the backlog then fail.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        let mut queue = self.inner.lock();
        queue.clear();
        drop(queue);
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..8 {
            queue.send(i).await.unwrap();
        }
        for i in 0..8 {
            assert_eq!(queue.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_send_blocks_at_capacity() {
        let queue = Arc::new(BoundedQueue::new(2));
        queue.send(1).await.unwrap();
        queue.send(2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.send(3)).await;
        assert!(blocked.is_err(), "send past capacity must block");

        // Draining one slot lets the pending send through.
        assert_eq!(queue.recv().await, Some(1));
        queue.send(3).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_try_send_full_and_try_recv_empty() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        queue.try_send(7).unwrap();
        assert!(matches!(queue.try_send(8), Err(TrySendError::Full(8))));
        assert_eq!(queue.try_recv().unwrap(), 7);
        assert_eq!(queue.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_receiver() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver must wake on shutdown")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_sender() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.send(1).await.unwrap();
        let sender = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.send(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("sender must wake on shutdown")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recv_drains_after_shutdown() {
        let queue = BoundedQueue::new(4);
        queue.send(1).await.unwrap();
        queue.send(2).await.unwrap();
        queue.shutdown();
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, None);
        assert!(queue.send(3).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mpmc_conserves_items() {
        let queue = Arc::new(BoundedQueue::new(16));
        let mut producers = Vec::new();
        for p in 0..4u64 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    queue.send(p * 1000 + i).await.unwrap();
                }
            }));
        }
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = queue.recv().await {
                    got.push(item);
                }
                got
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        queue.shutdown();
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400, "every item received exactly once");
    }
}
