//! Batch container
//!
//! Frames move between stages in groups of up to [`BATCH_CAPACITY`]. A batch
//! is owned by exactly one stage at a time and is never enlarged after it
//! leaves the batch buffer.

use std::time::{Duration, Instant};

use crate::frame::{Frame, StageKind};

/// Maximum number of frames per batch.
pub const BATCH_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct Batch {
    pub batch_id: u64,
    pub frames: Vec<Frame>,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub stage_done: [bool; StageKind::COUNT],
}

impl Batch {
    pub fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            frames: Vec::with_capacity(BATCH_CAPACITY),
            created_at: Instant::now(),
            started_at: None,
            stage_done: [false; StageKind::COUNT],
        }
    }

    /// Appends a frame. Fails once the batch holds [`BATCH_CAPACITY`] frames.
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        if self.frames.len() >= BATCH_CAPACITY {
            return Err(frame);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= BATCH_CAPACITY
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Stamps the processing start time on first call.
    pub fn start_processing(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn mark_done(&mut self, stage: StageKind) {
        self.stage_done[stage as usize] = true;
        for frame in &mut self.frames {
            frame.mark_done(stage);
        }
    }

    pub fn is_done(&self, stage: StageKind) -> bool {
        self.stage_done[stage as usize]
    }

    /// Order-sensitive stages require frames in ascending frame id.
    pub fn sort_by_frame_id(&mut self) {
        self.frames.sort_by_key(|frame| frame.frame_id);
    }
}
