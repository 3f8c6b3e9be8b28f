//! Error types for the highway event pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline is not running")]
    Stopped,

    #[error("Ingress saturated, frame not accepted within the deadline")]
    Backpressured,

    #[error("Queue is full")]
    QueueFull,

    #[error("Queue was shut down")]
    QueueClosed,

    #[error("Worker pool was stopped")]
    PoolStopped,

    #[error("Worker task panicked: {0}")]
    TaskPanicked(String),

    #[error("Batch capacity exceeded")]
    BatchFull,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
