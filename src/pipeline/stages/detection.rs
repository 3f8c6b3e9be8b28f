//! Object detection stage
//!
//! Crops each frame's source image to its ROI and runs one batched forward
//! pass over the crops. Boxes are stored ROI-local; the tracking stage maps
//! them into source coordinates. An optional second pass adds pedestrian
//! detections.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::batch::Batch;
use crate::config::Tunables;
use crate::engine::DetectEngine;
use crate::error::{PipelineError, Result};
use crate::frame::{DetectionBox, ImageBuffer, StageKind};
use crate::imgops;
use crate::pipeline::stage::BatchStage;

pub const CLASS_VEHICLE: i32 = 0;
pub const CLASS_PEDESTRIAN: i32 = 1;

pub struct DetectionStage {
    engine: Arc<dyn DetectEngine>,
    pedestrian_engine: Option<Arc<dyn DetectEngine>>,
    tunables: Arc<RwLock<Tunables>>,
}

impl DetectionStage {
    pub fn new(
        engine: Arc<dyn DetectEngine>,
        pedestrian_engine: Option<Arc<dyn DetectEngine>>,
        tunables: Arc<RwLock<Tunables>>,
    ) -> Self {
        Self {
            engine,
            pedestrian_engine,
            tunables,
        }
    }

    async fn forward_batch(
        engine: Arc<dyn DetectEngine>,
        crops: Vec<ImageBuffer>,
    ) -> Result<Vec<Vec<DetectionBox>>> {
        tokio::task::spawn_blocking(move || engine.forward(&crops))
            .await
            .map_err(|e| PipelineError::Inference(e.to_string()))?
    }
}

#[async_trait]
impl BatchStage for DetectionStage {
    fn kind(&self) -> StageKind {
        StageKind::Detection
    }

    async fn process(&self, mut batch: Batch) -> Result<Batch> {
        if batch.is_empty() {
            batch.mark_done(StageKind::Detection);
            return Ok(batch);
        }

        let crops: Vec<ImageBuffer> = batch
            .frames
            .iter()
            .map(|frame| imgops::crop(&frame.source, frame.roi))
            .collect();

        let pedestrian_crops = self.pedestrian_engine.as_ref().map(|_| crops.clone());

        // A failed forward pass drops the whole batch; every frame in it
        // surfaces as a timeout at the rendezvous.
        let vehicle_groups = Self::forward_batch(self.engine.clone(), crops).await?;

        let pedestrian_groups = match (&self.pedestrian_engine, pedestrian_crops) {
            (Some(engine), Some(crops)) => match Self::forward_batch(engine.clone(), crops).await {
                Ok(groups) => Some(groups),
                Err(e) => {
                    // Pedestrian pass is best-effort; vehicles already made it.
                    warn!(batch_id = batch.batch_id, error = %e, "Pedestrian detection failed");
                    None
                }
            },
            _ => None,
        };

        let conf_thresh = self.tunables.read().det_conf_thresh;
        for (index, frame) in batch.frames.iter_mut().enumerate() {
            frame.detections.clear();
            if let Some(boxes) = vehicle_groups.get(index) {
                frame.detections.extend(
                    boxes
                        .iter()
                        .filter(|b| b.confidence >= conf_thresh)
                        .map(|b| DetectionBox {
                            class_id: CLASS_VEHICLE,
                            ..*b
                        }),
                );
            }
            if let Some(groups) = &pedestrian_groups {
                if let Some(boxes) = groups.get(index) {
                    frame.detections.extend(
                        boxes
                            .iter()
                            .filter(|b| b.confidence >= conf_thresh)
                            .map(|b| DetectionBox {
                                class_id: CLASS_PEDESTRIAN,
                                ..*b
                            }),
                    );
                }
            }
        }

        batch.mark_done(StageKind::Detection);
        Ok(batch)
    }
}
