//! Semantic segmentation stage
//!
//! Resizes every frame of the batch in parallel on the worker pool (the
//! fixed segmentation input plus the long-edge tracking input), then runs
//! one batched inference call and assigns the returned label grids.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::engine::SegEngine;
use crate::error::Result;
use crate::frame::{ImageBuffer, StageKind};
use crate::imgops;
use crate::pipeline::stage::BatchStage;
use crate::worker_pool::{CompletionHandle, WorkerPool};

/// Side length of the square segmentation input.
pub const SEG_INPUT_SIZE: usize = 1024;

pub struct SegmentationStage {
    engine: Arc<dyn SegEngine>,
    pool: Arc<WorkerPool>,
    tracking_long_edge: usize,
}

impl SegmentationStage {
    pub fn new(engine: Arc<dyn SegEngine>, pool: Arc<WorkerPool>, tracking_long_edge: usize) -> Self {
        Self {
            engine,
            pool,
            tracking_long_edge,
        }
    }

    fn resize_inputs(
        source: ImageBuffer,
        tracking_long_edge: usize,
    ) -> (ImageBuffer, ImageBuffer, ImageBuffer) {
        let seg_input = imgops::resize_nearest(&source, SEG_INPUT_SIZE, SEG_INPUT_SIZE);
        let tracking_input = imgops::resize_long_edge(&source, tracking_long_edge);
        (source, seg_input, tracking_input)
    }

    /// Fans the per-frame resizes out to the pool, falling back to running
    /// on the stage worker when the pool backlog is at capacity. Frames
    /// never leave the batch: only the source buffer moves into the task,
    /// so a failed task leaves its frame in place with partial fields.
    async fn prepare_batch(&self, batch: &mut Batch) {
        let long_edge = self.tracking_long_edge;
        let mut handles: Vec<CompletionHandle<(ImageBuffer, ImageBuffer, ImageBuffer)>> =
            Vec::with_capacity(batch.len());
        for frame in batch.frames.iter_mut() {
            let source = std::mem::replace(&mut frame.source, ImageBuffer::new(0, 0, 0));
            let handle = match self
                .pool
                .submit(move || Self::resize_inputs(source, long_edge))
            {
                Ok(handle) => handle,
                Err(rejected) => {
                    debug!(reason = %rejected.reason, "Frame pool saturated, resizing inline");
                    rejected.run_inline()
                }
            };
            handles.push(handle);
        }
        for (frame, handle) in batch.frames.iter_mut().zip(handles) {
            match handle.wait().await {
                Ok((source, seg_input, tracking_input)) => {
                    frame.source = source;
                    frame.seg_input = Some(seg_input);
                    frame.tracking_input = Some(tracking_input);
                }
                Err(err) => {
                    // The frame stays in the batch and propagates with
                    // whatever fields it has.
                    warn!(
                        frame_id = frame.frame_id,
                        error = %err,
                        "Segmentation pre-processing failed, continuing with partial fields"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl BatchStage for SegmentationStage {
    fn kind(&self) -> StageKind {
        StageKind::Segmentation
    }

    async fn process(&self, mut batch: Batch) -> Result<Batch> {
        if batch.is_empty() {
            batch.mark_done(StageKind::Segmentation);
            return Ok(batch);
        }

        self.prepare_batch(&mut batch).await;

        // One inference call for the whole batch. The inputs move into the
        // blocking call and come back so the frames keep them.
        let inputs: Vec<ImageBuffer> = batch
            .frames
            .iter_mut()
            .map(|frame| {
                frame
                    .seg_input
                    .take()
                    .unwrap_or_else(|| ImageBuffer::new(SEG_INPUT_SIZE, SEG_INPUT_SIZE, 3))
            })
            .collect();

        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let masks = engine.predict(&inputs);
            (inputs, masks)
        })
        .await;

        match outcome {
            Ok((inputs, Ok(masks))) => {
                for ((frame, seg_input), mask) in
                    batch.frames.iter_mut().zip(inputs).zip(masks)
                {
                    frame.seg_input = Some(seg_input);
                    frame.mask_width = mask.width;
                    frame.mask_height = mask.height;
                    frame.mask = Some(mask);
                }
            }
            Ok((inputs, Err(err))) => {
                // Frames proceed with partial fields; downstream stages cope
                // with a missing mask.
                warn!(batch_id = batch.batch_id, error = %err, "Segmentation inference failed");
                for (frame, seg_input) in batch.frames.iter_mut().zip(inputs) {
                    frame.seg_input = Some(seg_input);
                }
            }
            Err(join_err) => {
                warn!(batch_id = batch.batch_id, error = %join_err, "Segmentation task failed");
            }
        }

        batch.mark_done(StageKind::Segmentation);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::synthetic::SyntheticSeg;
    use crate::frame::Frame;

    fn batch_of(count: u64) -> Batch {
        let mut batch = Batch::new(1);
        for id in 0..count {
            batch
                .push(Frame::new(id, ImageBuffer::new(640, 360, 3)))
                .unwrap();
        }
        batch
    }

    #[tokio::test]
    async fn test_segmentation_fills_inputs_and_mask() {
        let pool = Arc::new(WorkerPool::new("seg-test", 2));
        let stage = SegmentationStage::new(Arc::new(SyntheticSeg), pool.clone(), 640);
        let batch = stage.process(batch_of(4)).await.unwrap();
        assert!(batch.is_done(StageKind::Segmentation));
        assert_eq!(batch.len(), 4);
        for frame in &batch.frames {
            let seg_input = frame.seg_input.as_ref().unwrap();
            assert_eq!((seg_input.width, seg_input.height), (SEG_INPUT_SIZE, SEG_INPUT_SIZE));
            let tracking_input = frame.tracking_input.as_ref().unwrap();
            assert_eq!(tracking_input.width.max(tracking_input.height), 640);
            let mask = frame.mask.as_ref().unwrap();
            assert_eq!((mask.width, mask.height), (SEG_INPUT_SIZE, SEG_INPUT_SIZE));
            assert!(frame.is_done(StageKind::Segmentation));
        }
        pool.stop();
    }

    #[tokio::test]
    async fn test_inference_failure_keeps_frames() {
        struct BrokenSeg;
        impl SegEngine for BrokenSeg {
            fn predict(
                &self,
                _inputs: &[ImageBuffer],
            ) -> Result<Vec<crate::frame::LabelGrid>> {
                Err(crate::error::PipelineError::Inference("offline".into()))
            }
        }

        let pool = Arc::new(WorkerPool::new("seg-test", 2));
        let stage = SegmentationStage::new(Arc::new(BrokenSeg), pool.clone(), 640);
        let batch = stage.process(batch_of(2)).await.unwrap();
        // Partial fields, but the stage-done flag still releases downstream.
        assert!(batch.is_done(StageKind::Segmentation));
        assert_eq!(batch.len(), 2);
        for frame in &batch.frames {
            assert!(frame.mask.is_none());
            assert!(frame.seg_input.is_some());
        }
        pool.stop();
    }
}
