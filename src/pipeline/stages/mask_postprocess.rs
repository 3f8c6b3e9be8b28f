//! Mask post-processing stage
//!
//! Cleans each frame's segmentation mask (keep the largest connected white
//! region, binarize) and derives the detection ROI from it, rescaled from
//! mask coordinates into source coordinates. A frame without a usable mask
//! keeps the full-frame ROI.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::error::Result;
use crate::frame::{LabelGrid, Rect, StageKind};
use crate::imgops;
use crate::pipeline::stage::BatchStage;
use crate::worker_pool::{CompletionHandle, WorkerPool};

pub struct MaskPostprocessStage {
    pool: Arc<WorkerPool>,
}

impl MaskPostprocessStage {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// Cleans a mask taken out of its frame and derives the source-space
    /// ROI. The frame itself stays in the batch; this sees only the moved
    /// pieces.
    fn clean_mask(
        mask: Option<LabelGrid>,
        mask_width: usize,
        mask_height: usize,
        width: usize,
        height: usize,
    ) -> (Option<LabelGrid>, Rect) {
        let Some(mut mask) = mask else {
            return (None, Rect::full(width, height));
        };

        let area = imgops::keep_largest_region(&mut mask);
        if area == 0 {
            return (Some(mask), Rect::full(width, height));
        }

        let roi = match imgops::bounding_roi(&mask) {
            Some(mask_roi) => {
                let scaled =
                    imgops::scale_rect(mask_roi, mask_width, mask_height, width, height);
                if scaled.is_empty() {
                    Rect::full(width, height)
                } else {
                    scaled
                }
            }
            None => Rect::full(width, height),
        };
        (Some(mask), roi)
    }
}

#[async_trait]
impl BatchStage for MaskPostprocessStage {
    fn kind(&self) -> StageKind {
        StageKind::MaskPostprocess
    }

    async fn process(&self, mut batch: Batch) -> Result<Batch> {
        let mut handles: Vec<CompletionHandle<(Option<LabelGrid>, Rect)>> =
            Vec::with_capacity(batch.len());
        for frame in batch.frames.iter_mut() {
            let mask = frame.mask.take();
            let (mask_width, mask_height) = (frame.mask_width, frame.mask_height);
            let (width, height) = (frame.width, frame.height);
            let handle = match self
                .pool
                .submit(move || Self::clean_mask(mask, mask_width, mask_height, width, height))
            {
                Ok(handle) => handle,
                Err(rejected) => {
                    debug!(reason = %rejected.reason, "Frame pool saturated, cleaning inline");
                    rejected.run_inline()
                }
            };
            handles.push(handle);
        }
        for (frame, handle) in batch.frames.iter_mut().zip(handles) {
            match handle.wait().await {
                Ok((mask, roi)) => {
                    frame.mask = mask;
                    frame.roi = roi;
                }
                Err(err) => {
                    // The frame keeps its full-frame ROI and propagates with
                    // partial fields.
                    warn!(
                        frame_id = frame.frame_id,
                        error = %err,
                        "Mask post-processing failed, continuing with partial fields"
                    );
                }
            }
        }

        batch.mark_done(StageKind::MaskPostprocess);
        Ok(batch)
    }
}
