//! Frame-level data model
//!
//! A `Frame` is created at ingress and mutated in place as it advances
//! through the pipeline stages; once published to the rendezvous it is
//! read-only by convention.

use std::time::Instant;

/// Pipeline stages, in flow order. The discriminant doubles as the index
/// into the per-stage completion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum StageKind {
    Segmentation = 0,
    MaskPostprocess = 1,
    Detection = 2,
    Tracking = 3,
    EventDetermine = 4,
}

impl StageKind {
    pub const COUNT: usize = 5;

    pub const ALL: [StageKind; Self::COUNT] = [
        StageKind::Segmentation,
        StageKind::MaskPostprocess,
        StageKind::Detection,
        StageKind::Tracking,
        StageKind::EventDetermine,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Segmentation => "segmentation",
            StageKind::MaskPostprocess => "mask_postprocess",
            StageKind::Detection => "detection",
            StageKind::Tracking => "tracking",
            StageKind::EventDetermine => "event_determine",
        }
    }
}

/// Per-object event status. Discriminants match the wire values used by
/// downstream consumers of the annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ObjectStatus {
    Unknown = -1,
    Normal = 0,
    ParkingLane = 1,
    ParkingEmergencyLane = 2,
    OccupyEmergencyLane = 3,
    WalkHighway = 4,
    HighwayJam = 5,
    TrafficAccident = 6,
}

/// Status of a `get`/`try_get` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Pending,
    Timeout,
    NotFound,
    Stopped,
    Error,
}

/// Interleaved 8-bit image buffer.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl ImageBuffer {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0; width * height * channels],
        }
    }

    pub fn from_data(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width * height * channels);
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Single-channel label grid produced by segmentation. Labels are class ids;
/// after mask post-processing the grid is binarized to {0, 255}.
#[derive(Debug, Clone)]
pub struct LabelGrid {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl LabelGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: width as i32,
            height: height as i32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Detection bounding box. Coordinates are ROI-local (relative to the crop
/// handed to the detector); the tracking stage maps them to source-absolute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub confidence: f32,
    pub class_id: i32,
    pub track_id: i64,
}

impl DetectionBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32, confidence: f32, class_id: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            confidence,
            class_id,
            track_id: -1,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn is_valid(&self) -> bool {
        self.left < self.right && self.top < self.bottom && self.confidence > 0.0
    }
}

/// Tracked bounding box in source-absolute coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackBox {
    pub track_id: i64,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub confidence: f32,
    pub class_id: i32,
    pub is_still: bool,
    pub status: ObjectStatus,
}

impl TrackBox {
    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }
}

/// One video frame and everything the stages annotate onto it.
#[derive(Debug)]
pub struct Frame {
    pub frame_id: u64,
    pub source: ImageBuffer,
    pub width: usize,
    pub height: usize,

    /// Fixed-size downscale fed to the segmentation engine.
    pub seg_input: Option<ImageBuffer>,
    /// Long-edge downscale fed to the parking detector.
    pub tracking_input: Option<ImageBuffer>,

    pub mask: Option<LabelGrid>,
    pub mask_width: usize,
    pub mask_height: usize,

    /// Detection region in source coordinates, derived from the cleaned mask.
    pub roi: Rect,

    /// ROI-local detector output.
    pub detections: Vec<DetectionBox>,
    /// Source-absolute tracker output with per-object status.
    pub tracks: Vec<TrackBox>,

    /// Minimum-width detection box in the configured band, source-absolute.
    /// Only populated when the event stage ran and found a candidate.
    pub filtered_box: Option<DetectionBox>,

    pub stage_done: [bool; StageKind::COUNT],
    pub created_at: Instant,
}

impl Frame {
    pub fn new(frame_id: u64, source: ImageBuffer) -> Self {
        let width = source.width;
        let height = source.height;
        Self {
            frame_id,
            source,
            width,
            height,
            seg_input: None,
            tracking_input: None,
            mask: None,
            mask_width: 0,
            mask_height: 0,
            roi: Rect::full(width, height),
            detections: Vec::new(),
            tracks: Vec::new(),
            filtered_box: None,
            stage_done: [false; StageKind::COUNT],
            created_at: Instant::now(),
        }
    }

    pub fn mark_done(&mut self, stage: StageKind) {
        self.stage_done[stage as usize] = true;
    }

    pub fn is_done(&self, stage: StageKind) -> bool {
        self.stage_done[stage as usize]
    }
}

/// What a caller gets back from `get`/`try_get`.
#[derive(Debug)]
pub struct FrameResult {
    pub status: ResultStatus,
    pub frame_id: u64,
    pub detections: Vec<DetectionBox>,
    pub tracks: Vec<TrackBox>,
    pub filtered_box: Option<DetectionBox>,
    pub mask: Option<LabelGrid>,
    pub source: Option<ImageBuffer>,
    pub roi: Rect,
    pub stage_done: [bool; StageKind::COUNT],
}

impl FrameResult {
    pub fn not_ready(status: ResultStatus, frame_id: u64) -> Self {
        Self {
            status,
            frame_id,
            detections: Vec::new(),
            tracks: Vec::new(),
            filtered_box: None,
            mask: None,
            source: None,
            roi: Rect::default(),
            stage_done: [false; StageKind::COUNT],
        }
    }

    pub fn success(frame: Frame) -> Self {
        Self {
            status: ResultStatus::Success,
            frame_id: frame.frame_id,
            stage_done: frame.stage_done,
            detections: frame.detections,
            tracks: frame.tracks,
            filtered_box: frame.filtered_box,
            mask: frame.mask,
            source: Some(frame.source),
            roi: frame.roi,
        }
    }

    pub fn has_filtered_box(&self) -> bool {
        self.filtered_box.is_some()
    }
}
