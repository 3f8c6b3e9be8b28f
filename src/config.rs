//! Configuration for the highway event pipeline

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    // Stage toggles. Mask post-processing and event determination require
    // segmentation; tracking requires detection. Disabled stages are wired
    // around.
    #[serde(default = "default_true")]
    pub enable_segmentation: bool,
    #[serde(default = "default_true")]
    pub enable_mask_postprocess: bool,
    #[serde(default = "default_true")]
    pub enable_detection: bool,
    #[serde(default = "default_true")]
    pub enable_tracking: bool,
    #[serde(default = "default_true")]
    pub enable_event_determine: bool,

    // Per-stage worker counts
    #[serde(default = "default_segmentation_threads")]
    pub segmentation_threads: usize,
    #[serde(default = "default_one_thread")]
    pub mask_postprocess_threads: usize,
    #[serde(default = "default_detection_threads")]
    pub detection_threads: usize,
    #[serde(default = "default_one_thread")]
    pub tracking_threads: usize,
    #[serde(default = "default_one_thread")]
    pub event_determine_threads: usize,

    /// OS-thread pool shared by the per-frame fan-out inside the heavy
    /// stages (distinct from the stage workers above).
    #[serde(default = "default_frame_pool_threads")]
    pub frame_pool_threads: usize,

    // Batching and queueing
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,
    #[serde(default = "default_ready_batch_cap")]
    pub ready_batch_cap: usize,
    #[serde(default = "default_connector_cap")]
    pub connector_cap: usize,

    // Caller-facing deadlines (milliseconds)
    #[serde(default = "default_add_timeout_ms")]
    pub add_timeout_ms: u64,
    #[serde(default = "default_get_timeout_ms")]
    pub get_timeout_ms: u64,

    // Model configuration (opaque to the core; immutable once started)
    #[serde(default = "default_seg_model_path")]
    pub seg_model_path: String,
    #[serde(default = "default_car_det_model_path")]
    pub car_det_model_path: String,
    #[serde(default = "default_pedestrian_det_model_path")]
    pub pedestrian_det_model_path: String,
    #[serde(default)]
    pub enable_pedestrian_detect: bool,

    // Detection thresholds
    #[serde(default = "default_det_conf_thresh")]
    pub det_conf_thresh: f32,
    #[serde(default = "default_det_iou_thresh")]
    pub det_iou_thresh: f32,

    /// Long edge of the downscaled copy the parking detector consumes.
    #[serde(default = "default_tracking_long_edge")]
    pub tracking_long_edge: usize,

    // Event determination geometry
    #[serde(default = "default_event_top_fraction")]
    pub event_top_fraction: f32,
    #[serde(default = "default_event_bottom_fraction")]
    pub event_bottom_fraction: f32,
    #[serde(default = "default_times_car_width")]
    pub times_car_width: f32,

    /// Retention cap for unread results at the rendezvous.
    #[serde(default = "default_result_soft_cap")]
    pub result_soft_cap: usize,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    // Memory monitoring
    #[serde(default = "default_true")]
    pub memory_monitor_enabled: bool,
    #[serde(default = "default_memory_check_interval_ms")]
    pub memory_check_interval_ms: u64,
    #[serde(default = "default_memory_leak_threshold")]
    pub memory_leak_threshold_mb_per_min: f64,
}

fn default_true() -> bool {
    true
}

fn default_segmentation_threads() -> usize {
    2
}

fn default_one_thread() -> usize {
    1
}

fn default_detection_threads() -> usize {
    2
}

fn default_frame_pool_threads() -> usize {
    4
}

fn default_batch_flush_ms() -> u64 {
    100
}

fn default_ready_batch_cap() -> usize {
    8
}

fn default_connector_cap() -> usize {
    10
}

fn default_add_timeout_ms() -> u64 {
    5000
}

fn default_get_timeout_ms() -> u64 {
    30000
}

fn default_seg_model_path() -> String {
    "seg_model".to_string()
}

fn default_car_det_model_path() -> String {
    "car_detect.onnx".to_string()
}

fn default_pedestrian_det_model_path() -> String {
    "person_detect.onnx".to_string()
}

fn default_det_conf_thresh() -> f32 {
    0.25
}

fn default_det_iou_thresh() -> f32 {
    0.2
}

fn default_tracking_long_edge() -> usize {
    640
}

fn default_event_top_fraction() -> f32 {
    4.0 / 7.0
}

fn default_event_bottom_fraction() -> f32 {
    8.0 / 9.0
}

fn default_times_car_width() -> f32 {
    3.0
}

fn default_result_soft_cap() -> usize {
    1000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_memory_check_interval_ms() -> u64 {
    1000
}

fn default_memory_leak_threshold() -> f64 {
    50.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty source yields every serde default.
        serde_json::from_str("{}").expect("defaults are total")
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        // Build config from environment (HIGHWAY__BATCH_FLUSH_MS etc.)
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("HIGHWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: PipelineConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Enforces the stage dependency rules and basic sanity bounds. A
    /// rejected configuration prevents `start`.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::PipelineError::InvalidConfig;

        if self.enable_mask_postprocess && !self.enable_segmentation {
            return Err(InvalidConfig(
                "mask post-processing requires segmentation".to_string(),
            ));
        }
        if self.enable_event_determine && !self.enable_segmentation {
            return Err(InvalidConfig(
                "event determination requires segmentation".to_string(),
            ));
        }
        if self.enable_tracking && !self.enable_detection {
            return Err(InvalidConfig("tracking requires detection".to_string()));
        }
        if self.ready_batch_cap == 0 {
            return Err(InvalidConfig("ready_batch_cap must be positive".to_string()));
        }
        if self.connector_cap == 0 {
            return Err(InvalidConfig("connector_cap must be positive".to_string()));
        }
        if self.batch_flush_ms == 0 {
            return Err(InvalidConfig("batch_flush_ms must be positive".to_string()));
        }
        if self.tracking_long_edge == 0 {
            return Err(InvalidConfig(
                "tracking_long_edge must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.event_top_fraction)
            || !(0.0..=1.0).contains(&self.event_bottom_fraction)
            || self.event_top_fraction >= self.event_bottom_fraction
        {
            return Err(InvalidConfig(
                "event band fractions must satisfy 0 <= top < bottom <= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_flush(&self) -> Duration {
        Duration::from_millis(self.batch_flush_ms)
    }

    pub fn add_timeout(&self) -> Duration {
        Duration::from_millis(self.add_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    /// The parameters `change_params` may replace while running.
    pub fn tunables(&self) -> Tunables {
        Tunables {
            event_top_fraction: self.event_top_fraction,
            event_bottom_fraction: self.event_bottom_fraction,
            times_car_width: self.times_car_width,
            det_conf_thresh: self.det_conf_thresh,
            add_timeout: self.add_timeout(),
            get_timeout: self.get_timeout(),
        }
    }
}

/// Mutable-at-runtime parameter set. Model paths, stage toggles, thread
/// counts, and queue capacities are fixed once the pipeline starts.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub event_top_fraction: f32,
    pub event_bottom_fraction: f32,
    pub times_car_width: f32,
    pub det_conf_thresh: f32,
    pub add_timeout: Duration,
    pub get_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = PipelineConfig::default();
        assert!(config.enable_segmentation);
        assert_eq!(config.segmentation_threads, 2);
        assert_eq!(config.batch_flush_ms, 100);
        assert_eq!(config.connector_cap, 10);
        assert_eq!(config.result_soft_cap, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mask_requires_segmentation() {
        let config = PipelineConfig {
            enable_segmentation: false,
            enable_event_determine: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tracking_requires_detection() {
        let config = PipelineConfig {
            enable_detection: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detection_only_is_valid() {
        let config = PipelineConfig {
            enable_segmentation: false,
            enable_mask_postprocess: false,
            enable_event_determine: false,
            enable_tracking: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_band_fractions_checked() {
        let config = PipelineConfig {
            event_top_fraction: 0.9,
            event_bottom_fraction: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
