//! Pipeline coordinator
//!
//! Wires the batch buffer, the enabled stages, the forwarder tasks between
//! them, the final sink, and the result rendezvous into one lifecycle. A
//! disabled stage is skipped at wiring time: the forwarder for its edge
//! simply connects to the next enabled stage.

pub mod stage;
pub mod stages;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch_buffer::BatchBuffer;
use crate::config::{PipelineConfig, Tunables};
use crate::engine::EngineSet;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, FrameResult, ImageBuffer, ResultStatus};
use crate::memory::MemoryMonitor;
use crate::metrics;
use crate::queue::BoundedQueue;
use crate::rendezvous::{FrameRendezvous, TryOutcome, WaitOutcome};
use crate::worker_pool::WorkerPool;

use stage::StageRunner;
use stages::{
    DetectionStage, EventDetermineStage, MaskPostprocessStage, SegmentationStage, TrackingStage,
};

/// Overall join budget for the coordinator tasks during `stop`.
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(5);

pub struct Pipeline {
    config: PipelineConfig,
    tunables: Arc<RwLock<Tunables>>,
    buffer: Arc<BatchBuffer>,
    frame_pool: Arc<WorkerPool>,
    /// Enabled stages in flow order.
    stages: Vec<Arc<StageRunner>>,
    final_queue: Arc<BoundedQueue<crate::batch::Batch>>,
    rendezvous: Arc<FrameRendezvous>,
    memory_monitor: Option<Arc<MemoryMonitor>>,
    next_frame_id: AtomicU64,
    running: Arc<AtomicBool>,
    stop_notify: Arc<tokio::sync::Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Validates the configuration and builds the enabled stages. Nothing
    /// runs until `start`.
    pub fn new(config: PipelineConfig, engines: EngineSet) -> Result<Self> {
        config.validate()?;

        let tunables = Arc::new(RwLock::new(config.tunables()));
        let frame_pool = Arc::new(WorkerPool::new("frame-pool", config.frame_pool_threads));

        let mut stages: Vec<Arc<StageRunner>> = Vec::new();
        if config.enable_segmentation {
            stages.push(Arc::new(StageRunner::new(
                Arc::new(SegmentationStage::new(
                    engines.seg.clone(),
                    frame_pool.clone(),
                    config.tracking_long_edge,
                )),
                config.segmentation_threads,
                config.connector_cap,
            )));
        }
        if config.enable_mask_postprocess {
            stages.push(Arc::new(StageRunner::new(
                Arc::new(MaskPostprocessStage::new(frame_pool.clone())),
                config.mask_postprocess_threads,
                config.connector_cap,
            )));
        }
        if config.enable_detection {
            let pedestrian = if config.enable_pedestrian_detect {
                engines.pedestrian_detect.clone()
            } else {
                None
            };
            stages.push(Arc::new(StageRunner::new(
                Arc::new(DetectionStage::new(
                    engines.detect.clone(),
                    pedestrian,
                    tunables.clone(),
                )),
                config.detection_threads,
                config.connector_cap,
            )));
        }
        if config.enable_tracking {
            stages.push(Arc::new(StageRunner::new(
                Arc::new(TrackingStage::new(
                    engines.tracker.clone(),
                    engines.parking.clone(),
                )),
                config.tracking_threads,
                config.connector_cap,
            )));
        }
        if config.enable_event_determine {
            stages.push(Arc::new(StageRunner::new(
                Arc::new(EventDetermineStage::new(tunables.clone())),
                config.event_determine_threads,
                config.connector_cap,
            )));
        }

        let buffer = Arc::new(BatchBuffer::new(
            config.batch_flush(),
            config.ready_batch_cap,
        ));
        let final_queue = Arc::new(BoundedQueue::new(config.connector_cap));
        let rendezvous = Arc::new(FrameRendezvous::new(config.result_soft_cap));
        let memory_monitor = config.memory_monitor_enabled.then(|| {
            Arc::new(MemoryMonitor::new(
                Duration::from_millis(config.memory_check_interval_ms),
                config.memory_leak_threshold_mb_per_min,
            ))
        });

        info!(
            stages = stages.len(),
            ready_batch_cap = config.ready_batch_cap,
            connector_cap = config.connector_cap,
            "Pipeline built"
        );

        Ok(Self {
            config,
            tunables,
            buffer,
            frame_pool,
            stages,
            final_queue,
            rendezvous,
            memory_monitor,
            next_frame_id: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(tokio::sync::Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the stages (downstream first), the batch buffer, and the
    /// coordinator tasks.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Pipeline already running");
            return;
        }

        // Downstream stages come up before anything can feed them.
        for runner in self.stages.iter().rev() {
            runner.start();
        }
        self.buffer.start();
        if let Some(monitor) = &self.memory_monitor {
            monitor.start();
        }

        let mut tasks = self.tasks.lock();

        // Ingress feeder: formed batches into the first enabled stage (or
        // straight to the sink when every stage is disabled).
        {
            let buffer = self.buffer.clone();
            let first = self.stages.first().cloned();
            let final_queue = self.final_queue.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = buffer.take().await {
                    let pushed = match &first {
                        Some(stage) => stage.enqueue(batch).await.is_ok(),
                        None => final_queue.send(batch).await.is_ok(),
                    };
                    if !pushed {
                        break;
                    }
                }
                debug!("Ingress feeder exiting");
            }));
        }

        // One forwarder per enabled edge, preserving batch arrival order.
        for pair in self.stages.windows(2) {
            let upstream = pair[0].clone();
            let downstream = pair[1].clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = upstream.dequeue_done().await {
                    if downstream.enqueue(batch).await.is_err() {
                        break;
                    }
                }
                debug!(
                    from = upstream.name(),
                    to = downstream.name(),
                    "Forwarder exiting"
                );
            }));
        }

        // Last enabled stage into the final sink connector.
        if let Some(last) = self.stages.last().cloned() {
            let final_queue = self.final_queue.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = last.dequeue_done().await {
                    if final_queue.send(batch).await.is_err() {
                        break;
                    }
                }
                debug!("Final forwarder exiting");
            }));
        }

        // Sink: publish every frame of a finished batch to the rendezvous.
        {
            let final_queue = self.final_queue.clone();
            let rendezvous = self.rendezvous.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = final_queue.recv().await {
                    let frames = batch.frames.len() as u64;
                    for mut frame in batch.frames {
                        // Working buffers are not part of the result record;
                        // retaining them would multiply rendezvous memory.
                        frame.seg_input = None;
                        frame.tracking_input = None;
                        rendezvous.publish(frame);
                    }
                    metrics::record_frames_completed("published", frames);
                }
                debug!("Result sink exiting");
            }));
        }

        // Status monitor.
        {
            let stages = self.stages.clone();
            let buffer = self.buffer.clone();
            let running = self.running.clone();
            let stop_notify = self.stop_notify.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    let stop = stop_notify.notified();
                    tokio::pin!(stop);
                    stop.as_mut().enable();
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = &mut stop => break,
                    }
                    for runner in &stages {
                        metrics::set_connector_depth(
                            runner.name(),
                            runner.pending_queue_size() as i64,
                        );
                        debug!(
                            stage = runner.name(),
                            processed = runner.processed_batches(),
                            avg_ms = runner.avg_ms(),
                            pending = runner.pending_queue_size(),
                            "Stage status"
                        );
                    }
                    debug!(
                        ready = buffer.ready_len(),
                        forming = buffer.forming_len(),
                        "Buffer status"
                    );
                }
            }));
        }

        info!("Pipeline started");
    }

    /// Submits a frame by copying the caller's buffer.
    pub async fn submit(&self, image: &ImageBuffer) -> Result<u64> {
        self.submit_move(image.clone()).await
    }

    /// Submits a frame, surrendering ownership of the buffer. Blocks up to
    /// `add_timeout_ms` under backpressure.
    pub async fn submit_move(&self, image: ImageBuffer) -> Result<u64> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PipelineError::Stopped);
        }
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new(frame_id, image);
        let add_timeout = self.tunables.read().add_timeout;

        match tokio::time::timeout(add_timeout, self.buffer.add(frame)).await {
            Ok(Ok(())) => Ok(frame_id),
            Ok(Err(_)) => Err(PipelineError::Stopped),
            Err(_) => {
                metrics::record_backpressure("ingress");
                debug!(frame_id, "Submit hit the ingress deadline");
                Err(PipelineError::Backpressured)
            }
        }
    }

    /// Blocks for the frame's result with the default deadline.
    pub async fn get(&self, frame_id: u64) -> FrameResult {
        let timeout = self.tunables.read().get_timeout;
        self.get_with_timeout(frame_id, timeout).await
    }

    pub async fn get_with_timeout(&self, frame_id: u64, timeout: Duration) -> FrameResult {
        if !self.running.load(Ordering::SeqCst) {
            return FrameResult::not_ready(ResultStatus::Stopped, frame_id);
        }
        match self.rendezvous.wait(frame_id, timeout).await {
            WaitOutcome::Ready(frame) => FrameResult::success(frame),
            WaitOutcome::NotFound => FrameResult::not_ready(ResultStatus::NotFound, frame_id),
            WaitOutcome::Timeout => FrameResult::not_ready(ResultStatus::Timeout, frame_id),
            WaitOutcome::Closed => FrameResult::not_ready(ResultStatus::Stopped, frame_id),
        }
    }

    /// Non-blocking result lookup. `Pending` means the frame was accepted
    /// but has not surfaced yet.
    pub fn try_get(&self, frame_id: u64) -> FrameResult {
        match self.rendezvous.try_get(frame_id) {
            TryOutcome::Ready(frame) => FrameResult::success(frame),
            TryOutcome::Closed => FrameResult::not_ready(ResultStatus::Stopped, frame_id),
            TryOutcome::NotFound => {
                let submitted = frame_id < self.next_frame_id.load(Ordering::SeqCst);
                let gone = self.rendezvous.was_delivered(frame_id)
                    || self.rendezvous.is_evicted(frame_id);
                if submitted && !gone {
                    FrameResult::not_ready(ResultStatus::Pending, frame_id)
                } else {
                    FrameResult::not_ready(ResultStatus::NotFound, frame_id)
                }
            }
        }
    }

    /// Replaces the mutable parameters. Model paths, stage toggles, thread
    /// counts, and queue capacities are immutable once built; differences in
    /// those fields are ignored with a warning.
    pub fn change_params(&self, config: &PipelineConfig) -> Result<()> {
        config.validate()?;
        if config.seg_model_path != self.config.seg_model_path
            || config.car_det_model_path != self.config.car_det_model_path
            || config.pedestrian_det_model_path != self.config.pedestrian_det_model_path
        {
            warn!("Model paths are immutable after construction; keeping the originals");
        }
        *self.tunables.write() = config.tunables();
        info!("Pipeline parameters updated");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames accepted so far (also the next frame id to be assigned).
    pub fn submitted_frames(&self) -> u64 {
        self.next_frame_id.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted_frames: self.submitted_frames(),
            buffer_ready: self.buffer.ready_len(),
            buffer_forming: self.buffer.forming_len(),
            pending_results: self.rendezvous.len(),
            published_results: self.rendezvous.published(),
            evicted_results: self.rendezvous.evicted(),
            stages: self
                .stages
                .iter()
                .map(|runner| StageStats {
                    name: runner.name(),
                    processed_batches: runner.processed_batches(),
                    avg_ms: runner.avg_ms(),
                    pending_batches: runner.pending_queue_size(),
                })
                .collect(),
        }
    }

    /// Human-readable status block, one line per stage.
    pub fn status_string(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "pipeline: running={} submitted={} ready={} forming={} results={} (evicted={})\n",
            self.is_running(),
            stats.submitted_frames,
            stats.buffer_ready,
            stats.buffer_forming,
            stats.pending_results,
            stats.evicted_results,
        );
        for stage in &stats.stages {
            out.push_str(&format!(
                "  {:<17} processed={:<6} avg={:>7.2}ms pending={}\n",
                stage.name, stage.processed_batches, stage.avg_ms, stage.pending_batches
            ));
        }
        if let Some(monitor) = &self.memory_monitor {
            out.push_str(&format!("  {}\n", monitor.report_string()));
        }
        out
    }

    /// Stops everything: buffer, stages (discarding queued batches), the
    /// coordinator tasks, and the rendezvous. Bounded by the join budget.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping pipeline");
        self.stop_notify.notify_waiters();

        self.buffer.stop().await;
        for runner in &self.stages {
            runner.stop().await;
        }
        self.final_queue.shutdown();
        self.rendezvous.shutdown();
        if let Some(monitor) = &self.memory_monitor {
            monitor.stop().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + STOP_JOIN_BUDGET;
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                error!("Coordinator task exceeded the stop budget, aborting");
                abort.abort();
            }
        }

        self.frame_pool.stop();
        info!("Pipeline stopped");
    }
}

#[derive(Debug, Clone)]
pub struct StageStats {
    pub name: &'static str,
    pub processed_batches: u64,
    pub avg_ms: f64,
    pub pending_batches: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub submitted_frames: u64,
    pub buffer_ready: usize,
    pub buffer_forming: usize,
    pub pending_results: usize,
    pub published_results: u64,
    pub evicted_results: u64,
    pub stages: Vec<StageStats>,
}
