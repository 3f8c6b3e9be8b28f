//! Highway event pipeline
//!
//! A batched five-stage detection pipeline for highway camera streams:
//! semantic segmentation -> mask post-processing -> object detection ->
//! multi-object tracking -> event determination. Frames are grouped into
//! batches of up to 32, flow through bounded connectors with per-stage
//! worker pools, and surface at a frame-id keyed rendezvous that callers
//! block on with a deadline. Ingress applies backpressure through the
//! bounded ready queue of the batch buffer.
//!
//! The CNN engines are consumed through the traits in [`engine`];
//! deterministic synthetic implementations ship for demos and tests.

pub mod batch;
pub mod batch_buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod imgops;
pub mod lane;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod rendezvous;
pub mod worker_pool;

pub use batch::{Batch, BATCH_CAPACITY};
pub use config::PipelineConfig;
pub use engine::EngineSet;
pub use error::{PipelineError, Result};
pub use frame::{
    DetectionBox, Frame, FrameResult, ImageBuffer, LabelGrid, ObjectStatus, Rect, ResultStatus,
    StageKind, TrackBox,
};
pub use pipeline::{Pipeline, PipelineStats, StageStats};
