//! Inference engine contracts
//!
//! The pipeline consumes the CNN engines through these seams and never
//! assumes anything about their internals beyond the threading rules stated
//! per trait. `synthetic` provides deterministic CPU implementations used by
//! the demo binary and the tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::frame::{DetectionBox, ImageBuffer, LabelGrid, TrackBox};

/// Semantic segmentation over a whole batch of inputs. Implementations must
/// be thread-safe per handle; the pipeline shares one handle per stage.
pub trait SegEngine: Send + Sync {
    fn predict(&self, inputs: &[ImageBuffer]) -> Result<Vec<LabelGrid>>;
}

/// Object detection over a batch of ROI crops. Boxes come back in
/// crop-local coordinates. Thread-safe per handle.
pub trait DetectEngine: Send + Sync {
    fn forward(&self, crops: &[ImageBuffer]) -> Result<Vec<Vec<DetectionBox>>>;
}

/// Multi-object tracker. Stateful across frames and NOT thread-safe: the
/// tracking stage serializes access. Input detections and output boxes share
/// the same (crop-local) coordinate space; `width`/`height` describe it.
pub trait TrackEngine: Send {
    fn track(&mut self, detections: &[DetectionBox], width: i32, height: i32) -> Vec<TrackBox>;
}

/// Stillness annotator. Consumes the downscaled tracking input and writes
/// `is_still` onto the boxes, which must be in that image's coordinates.
/// Stateful; serialized by the tracking stage.
pub trait ParkingDetect: Send {
    fn detect(&mut self, image: &ImageBuffer, tracks: &mut [TrackBox]);
}

/// Everything the pipeline needs, bundled for hand-off at construction.
pub struct EngineSet {
    pub seg: Arc<dyn SegEngine>,
    pub detect: Arc<dyn DetectEngine>,
    pub pedestrian_detect: Option<Arc<dyn DetectEngine>>,
    pub tracker: Arc<Mutex<Box<dyn TrackEngine>>>,
    pub parking: Arc<Mutex<Box<dyn ParkingDetect>>>,
}

impl EngineSet {
    /// Deterministic synthetic engines; the demo binary and the integration
    /// tests run on these.
    pub fn synthetic() -> Self {
        Self {
            seg: Arc::new(synthetic::SyntheticSeg::default()),
            detect: Arc::new(synthetic::SyntheticDetect::default()),
            pedestrian_detect: None,
            tracker: Arc::new(Mutex::new(Box::new(synthetic::SyntheticTracker::new()))),
            parking: Arc::new(Mutex::new(Box::new(synthetic::SyntheticParking::new()))),
        }
    }
}

pub mod synthetic {
    //! CPU stand-ins for the CNN engines.
    //!
    //! The segmenter paints a trapezoidal "road" narrowing toward the top of
    //! the frame; the detector reports bright rectangular blobs; the tracker
    //! does greedy IoU association; the parking detector compares centroids
    //! across calls.

    use std::collections::HashMap;

    use super::*;
    use crate::error::PipelineError;
    use crate::frame::ObjectStatus;

    #[derive(Debug, Default)]
    pub struct SyntheticSeg;

    impl SegEngine for SyntheticSeg {
        fn predict(&self, inputs: &[ImageBuffer]) -> Result<Vec<LabelGrid>> {
            let mut grids = Vec::with_capacity(inputs.len());
            for input in inputs {
                if input.width == 0 || input.height == 0 {
                    return Err(PipelineError::Inference("empty segmentation input".into()));
                }
                let mut grid = LabelGrid::new(input.width, input.height);
                // Road occupies the lower two thirds, narrowing upward.
                let road_top = input.height / 3;
                for y in road_top..input.height {
                    let progress = (y - road_top) as f64 / (input.height - road_top) as f64;
                    let span = ((0.25 + 0.75 * progress) * input.width as f64) as usize;
                    let start = (input.width - span) / 2;
                    for x in start..(start + span).min(input.width) {
                        grid.set(x, y, 1);
                    }
                }
                grids.push(grid);
            }
            Ok(grids)
        }
    }

    #[derive(Debug, Default)]
    pub struct SyntheticDetect;

    impl SyntheticDetect {
        /// Scans for axis-aligned bright blobs (pixel value >= 200 on the
        /// first channel) on a coarse grid and merges the hits into boxes.
        fn detect_blobs(crop: &ImageBuffer) -> Vec<DetectionBox> {
            const CELL: usize = 8;
            if crop.width < CELL || crop.height < CELL {
                return Vec::new();
            }
            let cells_x = crop.width / CELL;
            let cells_y = crop.height / CELL;
            let mut hot = vec![false; cells_x * cells_y];
            for cy in 0..cells_y {
                for cx in 0..cells_x {
                    let px = cx * CELL + CELL / 2;
                    let py = cy * CELL + CELL / 2;
                    let offset = (py * crop.width + px) * crop.channels;
                    if crop.data[offset] >= 200 {
                        hot[cy * cells_x + cx] = true;
                    }
                }
            }
            // Greedy merge of hot cells into rectangles, row-major.
            let mut boxes = Vec::new();
            let mut visited = vec![false; hot.len()];
            for cy in 0..cells_y {
                for cx in 0..cells_x {
                    let idx = cy * cells_x + cx;
                    if !hot[idx] || visited[idx] {
                        continue;
                    }
                    let mut max_x = cx;
                    while max_x + 1 < cells_x && hot[cy * cells_x + max_x + 1] {
                        max_x += 1;
                    }
                    let mut max_y = cy;
                    'rows: while max_y + 1 < cells_y {
                        for x in cx..=max_x {
                            if !hot[(max_y + 1) * cells_x + x] {
                                break 'rows;
                            }
                        }
                        max_y += 1;
                    }
                    for y in cy..=max_y {
                        for x in cx..=max_x {
                            visited[y * cells_x + x] = true;
                        }
                    }
                    boxes.push(DetectionBox::new(
                        (cx * CELL) as i32,
                        (cy * CELL) as i32,
                        ((max_x + 1) * CELL) as i32,
                        ((max_y + 1) * CELL) as i32,
                        0.9,
                        0,
                    ));
                }
            }
            boxes
        }
    }

    impl DetectEngine for SyntheticDetect {
        fn forward(&self, crops: &[ImageBuffer]) -> Result<Vec<Vec<DetectionBox>>> {
            Ok(crops.iter().map(Self::detect_blobs).collect())
        }
    }

    fn iou(a: &TrackBox, b: &DetectionBox) -> f64 {
        let ix = (a.right.min(b.right) - a.left.max(b.left)).max(0) as f64;
        let iy = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0) as f64;
        let intersection = ix * iy;
        let area_a = ((a.right - a.left) * (a.bottom - a.top)).max(0) as f64;
        let area_b = (b.width() * b.height()).max(0) as f64;
        let union = area_a + area_b - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    pub struct SyntheticTracker {
        next_id: i64,
        previous: Vec<TrackBox>,
    }

    impl SyntheticTracker {
        pub fn new() -> Self {
            Self {
                next_id: 1,
                previous: Vec::new(),
            }
        }
    }

    impl Default for SyntheticTracker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TrackEngine for SyntheticTracker {
        fn track(&mut self, detections: &[DetectionBox], _width: i32, _height: i32) -> Vec<TrackBox> {
            let mut tracks = Vec::with_capacity(detections.len());
            let mut claimed = vec![false; self.previous.len()];
            for detection in detections {
                let mut best: Option<(usize, f64)> = None;
                for (index, candidate) in self.previous.iter().enumerate() {
                    if claimed[index] {
                        continue;
                    }
                    let overlap = iou(candidate, detection);
                    if overlap > 0.3 && best.map_or(true, |(_, b)| overlap > b) {
                        best = Some((index, overlap));
                    }
                }
                let track_id = match best {
                    Some((index, _)) => {
                        claimed[index] = true;
                        self.previous[index].track_id
                    }
                    None => {
                        let id = self.next_id;
                        self.next_id += 1;
                        id
                    }
                };
                tracks.push(TrackBox {
                    track_id,
                    left: detection.left,
                    top: detection.top,
                    right: detection.right,
                    bottom: detection.bottom,
                    confidence: detection.confidence,
                    class_id: detection.class_id,
                    is_still: false,
                    status: ObjectStatus::Unknown,
                });
            }
            self.previous = tracks.clone();
            tracks
        }
    }

    pub struct SyntheticParking {
        last_centers: HashMap<i64, (i32, i32)>,
    }

    impl SyntheticParking {
        pub fn new() -> Self {
            Self {
                last_centers: HashMap::new(),
            }
        }
    }

    impl Default for SyntheticParking {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ParkingDetect for SyntheticParking {
        fn detect(&mut self, _image: &ImageBuffer, tracks: &mut [TrackBox]) {
            for track in tracks.iter_mut() {
                let center = track.center();
                if let Some(&(px, py)) = self.last_centers.get(&track.track_id) {
                    let dx = (center.0 - px).abs();
                    let dy = (center.1 - py).abs();
                    track.is_still = dx <= 2 && dy <= 2;
                }
                self.last_centers.insert(track.track_id, center);
            }
        }
    }

    /// Engine that never answers until released; exercises deadline and
    /// shutdown paths. Tests release it at teardown so the blocking thread
    /// does not outlive the runtime.
    pub struct HangingSeg {
        release: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl HangingSeg {
        pub fn new() -> Self {
            Self {
                release: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }

        pub fn release_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
            self.release.clone()
        }
    }

    impl Default for HangingSeg {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SegEngine for HangingSeg {
        fn predict(&self, _inputs: &[ImageBuffer]) -> Result<Vec<LabelGrid>> {
            while !self.release.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(PipelineError::Inference("engine released".into()))
        }
    }

    /// Engine that fails every call; exercises the drop-batch path.
    pub struct FailingDetect;

    impl DetectEngine for FailingDetect {
        fn forward(&self, _crops: &[ImageBuffer]) -> Result<Vec<Vec<DetectionBox>>> {
            Err(PipelineError::Inference("detector offline".into()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn image_with_blob(width: usize, height: usize, blob: (usize, usize, usize, usize)) -> ImageBuffer {
            let mut image = ImageBuffer::new(width, height, 3);
            let (x0, y0, x1, y1) = blob;
            for y in y0..y1 {
                for x in x0..x1 {
                    let offset = (y * width + x) * 3;
                    image.data[offset] = 255;
                    image.data[offset + 1] = 255;
                    image.data[offset + 2] = 255;
                }
            }
            image
        }

        #[test]
        fn test_synthetic_seg_paints_road() {
            let seg = SyntheticSeg;
            let grids = seg.predict(&[ImageBuffer::new(64, 64, 3)]).unwrap();
            let grid = &grids[0];
            assert_eq!(grid.at(32, 60), 1, "bottom center is road");
            assert_eq!(grid.at(32, 4), 0, "sky is not road");
        }

        #[test]
        fn test_synthetic_detect_finds_blob() {
            let detect = SyntheticDetect;
            let image = image_with_blob(128, 128, (32, 48, 64, 80));
            let boxes = &detect.forward(std::slice::from_ref(&image)).unwrap()[0];
            assert_eq!(boxes.len(), 1);
            let found = boxes[0];
            assert!(found.left <= 32 && found.right >= 64);
            assert!(found.top <= 48 && found.bottom >= 80);
        }

        #[test]
        fn test_tracker_keeps_ids_stable() {
            let mut tracker = SyntheticTracker::new();
            let first = tracker.track(&[DetectionBox::new(10, 10, 50, 50, 0.9, 0)], 100, 100);
            let second = tracker.track(&[DetectionBox::new(12, 12, 52, 52, 0.9, 0)], 100, 100);
            assert_eq!(first[0].track_id, second[0].track_id);

            let third = tracker.track(&[DetectionBox::new(80, 80, 95, 95, 0.9, 0)], 100, 100);
            assert_ne!(third[0].track_id, first[0].track_id);
        }

        #[test]
        fn test_parking_marks_still_tracks() {
            let mut parking = SyntheticParking::new();
            let image = ImageBuffer::new(64, 64, 3);
            let make = |left: i32| TrackBox {
                track_id: 1,
                left,
                top: 10,
                right: left + 20,
                bottom: 30,
                confidence: 0.9,
                class_id: 0,
                is_still: false,
                status: ObjectStatus::Unknown,
            };
            let mut tracks = [make(10)];
            parking.detect(&image, &mut tracks);
            assert!(!tracks[0].is_still, "first observation is never still");
            let mut tracks = [make(11)];
            parking.detect(&image, &mut tracks);
            assert!(tracks[0].is_still);
            let mut tracks = [make(40)];
            parking.detect(&image, &mut tracks);
            assert!(!tracks[0].is_still);
        }
    }
}
