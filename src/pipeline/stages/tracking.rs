//! Multi-object tracking stage
//!
//! Order-sensitive: frames are sorted by frame id and fed to the tracker
//! sequentially, and the tracker lock is held for the whole batch so no two
//! batches interleave their exposure to the tracker state. Tracker output is
//! translated from ROI-local into source-absolute coordinates, then the
//! parking detector annotates `is_still` against the downscaled tracking
//! input.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::batch::Batch;
use crate::engine::{ParkingDetect, TrackEngine};
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, StageKind, TrackBox};
use crate::pipeline::stage::BatchStage;

pub struct TrackingStage {
    tracker: Arc<Mutex<Box<dyn TrackEngine>>>,
    parking: Arc<Mutex<Box<dyn ParkingDetect>>>,
}

impl TrackingStage {
    pub fn new(
        tracker: Arc<Mutex<Box<dyn TrackEngine>>>,
        parking: Arc<Mutex<Box<dyn ParkingDetect>>>,
    ) -> Self {
        Self { tracker, parking }
    }

    fn track_frame(
        frame: &mut Frame,
        tracker: &mut dyn TrackEngine,
        parking: &mut dyn ParkingDetect,
    ) {
        frame.tracks.clear();
        if frame.detections.is_empty() {
            return;
        }

        let roi = frame.roi;
        let local = tracker.track(&frame.detections, roi.width, roi.height);

        // ROI-local -> source-absolute.
        let mut tracks: Vec<TrackBox> = local
            .into_iter()
            .map(|mut track| {
                track.left = (track.left + roi.x).clamp(0, frame.width as i32);
                track.right = (track.right + roi.x).clamp(0, frame.width as i32);
                track.top = (track.top + roi.y).clamp(0, frame.height as i32);
                track.bottom = (track.bottom + roi.y).clamp(0, frame.height as i32);
                track
            })
            .collect();

        if let Some(tracking_input) = frame.tracking_input.as_ref() {
            if frame.width > 0 && frame.height > 0 {
                let sx = tracking_input.width as f64 / frame.width as f64;
                let sy = tracking_input.height as f64 / frame.height as f64;
                let mut scaled: Vec<TrackBox> = tracks
                    .iter()
                    .map(|track| TrackBox {
                        left: (track.left as f64 * sx) as i32,
                        right: (track.right as f64 * sx) as i32,
                        top: (track.top as f64 * sy) as i32,
                        bottom: (track.bottom as f64 * sy) as i32,
                        ..*track
                    })
                    .collect();
                parking.detect(tracking_input, &mut scaled);
                for (track, annotated) in tracks.iter_mut().zip(&scaled) {
                    track.is_still = annotated.is_still;
                }
            }
        }

        frame.tracks = tracks;
    }
}

#[async_trait]
impl BatchStage for TrackingStage {
    fn kind(&self) -> StageKind {
        StageKind::Tracking
    }

    async fn process(&self, mut batch: Batch) -> Result<Batch> {
        batch.sort_by_frame_id();

        let tracker = self.tracker.clone();
        let parking = self.parking.clone();
        let mut batch = tokio::task::spawn_blocking(move || {
            // Coarse lock: one batch at a time sees the tracker state.
            let mut tracker = tracker.lock();
            let mut parking = parking.lock();
            for frame in &mut batch.frames {
                Self::track_frame(frame, tracker.as_mut(), parking.as_mut());
            }
            batch
        })
        .await
        .map_err(|e| PipelineError::Inference(e.to_string()))?;

        batch.mark_done(StageKind::Tracking);
        Ok(batch)
    }
}
