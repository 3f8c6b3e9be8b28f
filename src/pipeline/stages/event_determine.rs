//! Event determination stage
//!
//! Order-sensitive. Per frame: pick the reference vehicle (narrowest
//! detection in the configured vertical band), derive the emergency-lane
//! polygons from the cleaned mask, and assign every track an
//! [`ObjectStatus`]. A per-track trajectory history feeds the longer-horizon
//! judgements; it is append-only with a per-track cap and lives behind a
//! mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::batch::Batch;
use crate::config::Tunables;
use crate::error::{PipelineError, Result};
use crate::frame::{DetectionBox, Frame, ObjectStatus, StageKind};
use crate::lane::{self, EmergencyLane, Point};
use crate::pipeline::stage::BatchStage;
use crate::pipeline::stages::detection::CLASS_PEDESTRIAN;

/// Cap on retained trajectory points per track.
const MAX_TRAJECTORY_POINTS: usize = 1000;
/// A track is considered stationary when its last few centroids stay inside
/// this radius.
const STATIONARY_WINDOW: usize = 5;
const STATIONARY_RADIUS: i32 = 5;

#[derive(Debug, Default)]
struct TrajectoryHistory {
    points: Vec<Point>,
    first_seen: u64,
}

pub struct EventDetermineStage {
    tunables: Arc<RwLock<Tunables>>,
    trajectories: Arc<Mutex<HashMap<i64, TrajectoryHistory>>>,
    batch_lock: Arc<Mutex<()>>,
}

impl EventDetermineStage {
    pub fn new(tunables: Arc<RwLock<Tunables>>) -> Self {
        Self {
            tunables,
            trajectories: Arc::new(Mutex::new(HashMap::new())),
            batch_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn tracked_object_count(&self) -> usize {
        self.trajectories.lock().len()
    }

    fn update_trajectories(
        trajectories: &Mutex<HashMap<i64, TrajectoryHistory>>,
        frame: &Frame,
    ) {
        let mut trajectories = trajectories.lock();
        for track in &frame.tracks {
            let entry = trajectories
                .entry(track.track_id)
                .or_insert_with(|| TrajectoryHistory {
                    first_seen: frame.frame_id,
                    ..Default::default()
                });
            entry.points.push(track.center());
            if entry.points.len() > MAX_TRAJECTORY_POINTS {
                entry.points.remove(0);
            }
        }
    }

    fn is_stationary(
        trajectories: &Mutex<HashMap<i64, TrajectoryHistory>>,
        track_id: i64,
        current_frame_id: u64,
    ) -> bool {
        let trajectories = trajectories.lock();
        let Some(history) = trajectories.get(&track_id) else {
            return false;
        };
        // Both enough observations and enough elapsed frames: a track that
        // flickered in and out is not "parked".
        if history.points.len() < STATIONARY_WINDOW
            || current_frame_id.saturating_sub(history.first_seen) + 1 < STATIONARY_WINDOW as u64
        {
            return false;
        }
        let recent = &history.points[history.points.len() - STATIONARY_WINDOW..];
        let (cx, cy) = recent[recent.len() - 1];
        recent
            .iter()
            .all(|&(x, y)| (x - cx).abs() <= STATIONARY_RADIUS && (y - cy).abs() <= STATIONARY_RADIUS)
    }

    /// Narrowest detection in the configured band, translated into source
    /// coordinates; the whole image is the fallback band.
    fn pick_reference_box(frame: &Frame, tunables: &Tunables) -> Option<DetectionBox> {
        if frame.detections.is_empty() {
            return None;
        }
        let source_boxes: Vec<DetectionBox> = frame
            .detections
            .iter()
            .map(|b| DetectionBox {
                left: b.left + frame.roi.x,
                right: b.right + frame.roi.x,
                top: b.top + frame.roi.y,
                bottom: b.bottom + frame.roi.y,
                ..*b
            })
            .collect();

        let band_top = (frame.height as f32 * tunables.event_top_fraction) as i32;
        let band_bottom = (frame.height as f32 * tunables.event_bottom_fraction) as i32;
        let index = lane::min_width_box_in_band(&source_boxes, band_top, band_bottom)
            .or_else(|| lane::min_width_box_in_band(&source_boxes, 0, frame.height as i32))?;
        Some(source_boxes[index])
    }

    /// Lane polygons in source coordinates, derived from the cleaned mask
    /// around the reference vehicle.
    fn derive_lane(frame: &Frame, reference: &DetectionBox, tunables: &Tunables) -> Option<EmergencyLane> {
        let mask = frame.mask.as_ref()?;
        if frame.width == 0 || frame.height == 0 || frame.mask_width == 0 || frame.mask_height == 0 {
            return None;
        }
        let car_width_mask =
            reference.width() as f64 * frame.mask_width as f64 / frame.width as f64;
        let car_low_y_mask =
            reference.bottom as f64 * frame.mask_height as f64 / frame.height as f64;
        let mut lane = lane::derive_emergency_lane(
            mask,
            car_width_mask,
            car_low_y_mask,
            tunables.times_car_width,
        )?;

        let sx = frame.width as f64 / frame.mask_width as f64;
        let sy = frame.height as f64 / frame.mask_height as f64;
        let scale = |points: &mut Vec<Point>| {
            for point in points.iter_mut() {
                point.0 = (point.0 as f64 * sx) as i32;
                point.1 = (point.1 as f64 * sy) as i32;
            }
        };
        scale(&mut lane.left_region);
        scale(&mut lane.right_region);
        scale(&mut lane.left_boundary);
        scale(&mut lane.right_boundary);
        Some(lane)
    }

    fn process_frame(
        frame: &mut Frame,
        tunables: &Tunables,
        trajectories: &Mutex<HashMap<i64, TrajectoryHistory>>,
    ) {
        Self::update_trajectories(trajectories, frame);

        frame.filtered_box = Self::pick_reference_box(frame, tunables);
        let lane = frame
            .filtered_box
            .as_ref()
            .and_then(|reference| Self::derive_lane(frame, reference, tunables));

        for track in &mut frame.tracks {
            if track.class_id == CLASS_PEDESTRIAN {
                track.status = ObjectStatus::WalkHighway;
                continue;
            }
            let center = track.center();
            let in_emergency_lane = lane
                .as_ref()
                .map(|lane| {
                    lane::point_in_polygon(&lane.left_region, center)
                        || lane::point_in_polygon(&lane.right_region, center)
                })
                .unwrap_or(false);

            track.status = if in_emergency_lane {
                if track.is_still {
                    ObjectStatus::ParkingEmergencyLane
                } else {
                    ObjectStatus::OccupyEmergencyLane
                }
            } else if track.is_still
                && Self::is_stationary(trajectories, track.track_id, frame.frame_id)
            {
                ObjectStatus::ParkingLane
            } else {
                ObjectStatus::Normal
            };
        }
    }
}

#[async_trait]
impl BatchStage for EventDetermineStage {
    fn kind(&self) -> StageKind {
        StageKind::EventDetermine
    }

    async fn process(&self, mut batch: Batch) -> Result<Batch> {
        batch.sort_by_frame_id();

        let tunables = self.tunables.clone();
        let trajectories = self.trajectories.clone();
        let batch_lock = self.batch_lock.clone();
        let mut batch = tokio::task::spawn_blocking(move || {
            // Batches reach here in arrival order; the lock keeps their
            // trajectory updates from interleaving.
            let _guard = batch_lock.lock();
            let tunables = *tunables.read();
            for frame in &mut batch.frames {
                Self::process_frame(frame, &tunables, &trajectories);
            }
            batch
        })
        .await
        .map_err(|e| PipelineError::Inference(e.to_string()))?;

        batch.mark_done(StageKind::EventDetermine);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::frame::{ImageBuffer, LabelGrid, TrackBox};

    fn tunables() -> Arc<RwLock<Tunables>> {
        Arc::new(RwLock::new(PipelineConfig::default().tunables()))
    }

    /// Road mask narrowing toward the top, binarized to 255.
    fn road_mask(width: usize, height: usize) -> LabelGrid {
        let mut mask = LabelGrid::new(width, height);
        for y in 0..height {
            let span = width / 4 + (y * 3 * width / 4) / height;
            let start = (width - span) / 2;
            for x in start..(start + span).min(width) {
                mask.set(x, y, 255);
            }
        }
        mask
    }

    fn track_at(id: i64, cx: i32, cy: i32, is_still: bool) -> TrackBox {
        TrackBox {
            track_id: id,
            left: cx - 6,
            right: cx + 6,
            top: cy - 6,
            bottom: cy + 6,
            confidence: 0.9,
            class_id: 0,
            is_still,
            status: ObjectStatus::Unknown,
        }
    }

    /// 200x160 frame over a 100x80 mask; ROI covers the full frame so
    /// detection coordinates line up with source coordinates.
    fn event_frame(id: u64) -> Frame {
        let mut frame = Frame::new(id, ImageBuffer::new(200, 160, 3));
        frame.mask = Some(road_mask(100, 80));
        frame.mask_width = 100;
        frame.mask_height = 80;
        // Reference vehicle: narrow box, center row inside the default band.
        frame
            .detections
            .push(DetectionBox::new(90, 120, 102, 140, 0.9, 0));
        frame
    }

    #[tokio::test]
    async fn test_lane_occupancy_statuses() {
        let stage = EventDetermineStage::new(tunables());
        let mut batch = Batch::new(1);
        let mut frame = event_frame(0);
        // Left road edge near the bottom sits inside the emergency lane.
        frame.tracks.push(track_at(1, 6, 154, false));
        // Road center is a normal lane.
        frame.tracks.push(track_at(2, 100, 140, false));
        batch.push(frame).unwrap();

        let batch = stage.process(batch).await.unwrap();
        let frame = &batch.frames[0];
        assert!(frame.filtered_box.is_some());
        assert_eq!(frame.tracks[0].status, ObjectStatus::OccupyEmergencyLane);
        assert_eq!(frame.tracks[1].status, ObjectStatus::Normal);
        assert!(frame.is_done(StageKind::EventDetermine));
    }

    #[tokio::test]
    async fn test_still_vehicle_in_lane_is_parking() {
        let stage = EventDetermineStage::new(tunables());
        let mut batch = Batch::new(1);
        let mut frame = event_frame(0);
        frame.tracks.push(track_at(1, 6, 154, true));
        batch.push(frame).unwrap();

        let batch = stage.process(batch).await.unwrap();
        assert_eq!(
            batch.frames[0].tracks[0].status,
            ObjectStatus::ParkingEmergencyLane
        );
    }

    #[tokio::test]
    async fn test_pedestrian_walks_highway() {
        let stage = EventDetermineStage::new(tunables());
        let mut batch = Batch::new(1);
        let mut frame = event_frame(0);
        let mut pedestrian = track_at(3, 100, 140, false);
        pedestrian.class_id = CLASS_PEDESTRIAN;
        frame.tracks.push(pedestrian);
        batch.push(frame).unwrap();

        let batch = stage.process(batch).await.unwrap();
        assert_eq!(batch.frames[0].tracks[0].status, ObjectStatus::WalkHighway);
    }

    #[tokio::test]
    async fn test_stationary_vehicle_outside_lane_is_parking_lane() {
        let stage = EventDetermineStage::new(tunables());
        // Same still track at the road center across enough frames to build
        // a stationary history.
        for id in 0..6u64 {
            let mut batch = Batch::new(id + 1);
            let mut frame = event_frame(id);
            frame.tracks.push(track_at(7, 100, 140, true));
            batch.push(frame).unwrap();
            let batch = stage.process(batch).await.unwrap();
            if id >= STATIONARY_WINDOW as u64 {
                assert_eq!(batch.frames[0].tracks[0].status, ObjectStatus::ParkingLane);
            }
        }
        assert_eq!(stage.tracked_object_count(), 1);
    }

    #[tokio::test]
    async fn test_no_detections_leaves_no_filtered_box() {
        let stage = EventDetermineStage::new(tunables());
        let mut batch = Batch::new(1);
        let mut frame = event_frame(0);
        frame.detections.clear();
        frame.tracks.push(track_at(1, 100, 140, false));
        batch.push(frame).unwrap();

        let batch = stage.process(batch).await.unwrap();
        let frame = &batch.frames[0];
        assert!(frame.filtered_box.is_none());
        // No lane geometry without a reference vehicle: plain status only.
        assert_eq!(frame.tracks[0].status, ObjectStatus::Normal);
    }

    #[tokio::test]
    async fn test_trajectory_cap_holds() {
        let stage = EventDetermineStage::new(tunables());
        for id in 0..(MAX_TRAJECTORY_POINTS + 50) as u64 {
            let mut batch = Batch::new(id + 1);
            let mut frame = event_frame(id);
            frame.tracks.push(track_at(9, 100 + (id % 40) as i32, 140, false));
            batch.push(frame).unwrap();
            stage.process(batch).await.unwrap();
        }
        let trajectories = stage.trajectories.lock();
        assert_eq!(trajectories[&9].points.len(), MAX_TRAJECTORY_POINTS);
    }
}
