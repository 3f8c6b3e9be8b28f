//! The five concrete pipeline stages.

pub mod detection;
pub mod event_determine;
pub mod mask_postprocess;
pub mod segmentation;
pub mod tracking;

pub use detection::DetectionStage;
pub use event_determine::EventDetermineStage;
pub use mask_postprocess::MaskPostprocessStage;
pub use segmentation::SegmentationStage;
pub use tracking::TrackingStage;
