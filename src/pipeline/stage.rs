//! Stage abstraction
//!
//! A [`BatchStage`] implements the per-batch computation; a [`StageRunner`]
//! gives it the runtime shape shared by all five stages: an input connector,
//! an output connector, and a fixed set of worker tasks pulling, processing,
//! and pushing. A batch whose processing fails is dropped with a log; its
//! frames eventually time out at the rendezvous.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::error::Result;
use crate::frame::StageKind;
use crate::metrics;
use crate::queue::BoundedQueue;

#[async_trait]
pub trait BatchStage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Processes one batch. Takes ownership and hands the batch back so the
    /// runner can forward it; an `Err` drops the whole batch.
    async fn process(&self, batch: Batch) -> Result<Batch>;
}

/// Join grace before a stuck worker is aborted. Keeps `stop` bounded even
/// when an engine hangs mid-call.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct StageRunner {
    stage: Arc<dyn BatchStage>,
    worker_count: usize,
    input: Arc<BoundedQueue<Batch>>,
    output: Arc<BoundedQueue<Batch>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    processed_batches: AtomicU64,
    total_processing_ms: AtomicU64,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn BatchStage>, worker_count: usize, connector_cap: usize) -> Self {
        Self {
            stage,
            worker_count: worker_count.max(1),
            input: Arc::new(BoundedQueue::new(connector_cap)),
            output: Arc::new(BoundedQueue::new(connector_cap)),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            processed_batches: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.stage.name()
    }

    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_id in 0..self.worker_count {
            let runner = self.clone();
            workers.push(tokio::spawn(async move {
                runner.worker_loop(worker_id).await;
            }));
        }
        info!(stage = self.name(), workers = self.worker_count, "Stage started");
    }

    async fn worker_loop(&self, worker_id: usize) {
        while let Some(mut batch) = self.input.recv().await {
            metrics::set_connector_depth(self.name(), self.input.len() as i64);
            batch.start_processing();
            let batch_id = batch.batch_id;
            let started = std::time::Instant::now();
            let _timer = metrics::StageTimer::new(self.name());

            match self.stage.process(batch).await {
                Ok(batch) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.processed_batches.fetch_add(1, Ordering::Relaxed);
                    self.total_processing_ms
                        .fetch_add(elapsed_ms, Ordering::Relaxed);
                    metrics::record_batch_processed(self.name());
                    debug!(
                        stage = self.name(),
                        worker_id,
                        batch_id,
                        elapsed_ms,
                        "Batch processed"
                    );
                    if self.output.send(batch).await.is_err() {
                        warn!(
                            stage = self.name(),
                            batch_id, "Output connector closed, batch discarded"
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        stage = self.name(),
                        batch_id,
                        error = %e,
                        "Batch processing failed, dropping batch"
                    );
                    metrics::record_batch_dropped(self.name());
                }
            }
        }
        debug!(stage = self.name(), worker_id, "Stage worker exiting");
    }

    /// Pushes a batch onto this stage's input connector.
    pub async fn enqueue(&self, batch: Batch) -> Result<()> {
        self.input
            .send(batch)
            .await
            .map_err(|_| crate::error::PipelineError::QueueClosed)
    }

    /// Pulls a processed batch from this stage's output connector.
    pub async fn dequeue_done(&self) -> Option<Batch> {
        self.output.recv().await
    }

    /// Closes the input, joins the workers (aborting any that outlive the
    /// grace period), then closes the output.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Remaining queued batches are discarded, not drained: stop must be
        // bounded even with a deep backlog.
        self.input.clear();
        self.input.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let abort = worker.abort_handle();
            if tokio::time::timeout(STOP_GRACE, worker).await.is_err() {
                warn!(stage = self.name(), "Worker did not finish in time, aborting");
                abort.abort();
            }
        }
        self.output.shutdown();
        info!(
            stage = self.name(),
            processed = self.processed_batches.load(Ordering::Relaxed),
            "Stage stopped"
        );
    }

    pub fn processed_batches(&self) -> u64 {
        self.processed_batches.load(Ordering::Relaxed)
    }

    pub fn avg_ms(&self) -> f64 {
        let processed = self.processed_batches.load(Ordering::Relaxed);
        if processed == 0 {
            0.0
        } else {
            self.total_processing_ms.load(Ordering::Relaxed) as f64 / processed as f64
        }
    }

    pub fn pending_queue_size(&self) -> usize {
        self.input.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, ImageBuffer};

    struct CountingStage {
        fail_batch: Option<u64>,
    }

    #[async_trait]
    impl BatchStage for CountingStage {
        fn kind(&self) -> StageKind {
            StageKind::Segmentation
        }

        async fn process(&self, mut batch: Batch) -> Result<Batch> {
            if Some(batch.batch_id) == self.fail_batch {
                return Err(crate::error::PipelineError::Inference("synthetic".into()));
            }
            batch.mark_done(StageKind::Segmentation);
            Ok(batch)
        }
    }

    fn batch(id: u64, frames: u64) -> Batch {
        let mut batch = Batch::new(id);
        for i in 0..frames {
            batch.push(Frame::new(id * 100 + i, ImageBuffer::new(4, 4, 3))).unwrap();
        }
        batch
    }

    #[tokio::test]
    async fn test_runner_processes_and_forwards() {
        let runner = Arc::new(StageRunner::new(
            Arc::new(CountingStage { fail_batch: None }),
            2,
            4,
        ));
        runner.start();
        runner.enqueue(batch(1, 3)).await.unwrap();
        let done = runner.dequeue_done().await.unwrap();
        assert!(done.is_done(StageKind::Segmentation));
        assert_eq!(runner.processed_batches(), 1);
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped() {
        let runner = Arc::new(StageRunner::new(
            Arc::new(CountingStage { fail_batch: Some(1) }),
            1,
            4,
        ));
        runner.start();
        runner.enqueue(batch(1, 2)).await.unwrap();
        runner.enqueue(batch(2, 2)).await.unwrap();
        // Batch 1 vanishes; batch 2 still comes through.
        let done = runner.dequeue_done().await.unwrap();
        assert_eq!(done.batch_id, 2);
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connectors() {
        let runner = Arc::new(StageRunner::new(
            Arc::new(CountingStage { fail_batch: None }),
            1,
            4,
        ));
        runner.start();
        runner.stop().await;
        assert!(runner.enqueue(batch(1, 1)).await.is_err());
        assert!(runner.dequeue_done().await.is_none());
    }

    #[tokio::test]
    async fn test_fifo_across_batches() {
        let runner = Arc::new(StageRunner::new(
            Arc::new(CountingStage { fail_batch: None }),
            1,
            8,
        ));
        runner.start();
        for id in 1..=5 {
            runner.enqueue(batch(id, 1)).await.unwrap();
        }
        for id in 1..=5 {
            assert_eq!(runner.dequeue_done().await.unwrap().batch_id, id);
        }
        runner.stop().await;
    }
}
