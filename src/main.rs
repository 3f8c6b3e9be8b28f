//! Highway event pipeline demo binary
//!
//! Drives the pipeline end-to-end on synthetic frames: a noisy road scene
//! with bright vehicle blobs drifting through it. Useful for smoke-testing
//! the concurrency behavior and watching the per-stage counters without any
//! real models attached.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use highway_pipeline::{EngineSet, ImageBuffer, Pipeline, PipelineConfig, ResultStatus};

/// Highway event pipeline - batched multi-stage frame processing
#[derive(Parser, Debug)]
#[command(name = "highway-pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batched five-stage highway event detection pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline on synthetic frames
    Run {
        /// Number of frames to submit (0 = until interrupted)
        #[arg(short = 'n', long, default_value = "256")]
        frames: u64,

        /// Frame width
        #[arg(long, default_value = "1280")]
        width: usize,

        /// Frame height
        #[arg(long, default_value = "720")]
        height: usize,

        /// Delay between submitted frames in milliseconds
        #[arg(long, default_value = "5")]
        interval_ms: u64,

        /// Disable tracking and event determination
        #[arg(long, default_value = "false")]
        detect_only: bool,
    },

    /// Print the effective configuration and exit
    Config,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// A noisy road frame with a couple of bright blobs sliding along the lanes.
fn synthetic_frame(width: usize, height: usize, tick: u64) -> ImageBuffer {
    let mut rng = rand::thread_rng();
    let mut image = ImageBuffer::new(width, height, 3);
    rng.fill(&mut image.data[..]);
    for value in image.data.iter_mut() {
        *value /= 4; // dim background noise
    }

    // Two vehicles: one cruising the middle, one hugging the right edge.
    let lane_y = height * 2 / 3;
    let positions = [
        ((tick as usize * 7) % width, lane_y),
        (width * 9 / 10, lane_y + height / 12),
    ];
    for (cx, cy) in positions {
        let half = width / 40;
        for y in cy.saturating_sub(half)..(cy + half).min(height) {
            for x in cx.saturating_sub(half)..(cx + half).min(width) {
                let offset = (y * width + x) * 3;
                image.data[offset] = 255;
                image.data[offset + 1] = 230;
                image.data[offset + 2] = 210;
            }
        }
    }
    image
}

async fn run_demo(
    config: PipelineConfig,
    frames: u64,
    width: usize,
    height: usize,
    interval: Duration,
) -> Result<()> {
    let pipeline = Arc::new(Pipeline::new(config.clone(), EngineSet::synthetic())?);
    pipeline.start();

    if config.metrics_enabled {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = highway_pipeline::metrics::start_metrics_server(addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port = config.metrics_port, "Metrics server started at /metrics");
    }

    // Reader: pull results as they land and tally the outcomes.
    let reader = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut next_id: u64 = 0;
            let mut success: u64 = 0;
            let mut failed: u64 = 0;
            loop {
                let result = pipeline
                    .get_with_timeout(next_id, Duration::from_secs(30))
                    .await;
                match result.status {
                    ResultStatus::Success => {
                        success += 1;
                        if success % 64 == 0 {
                            info!(
                                frame_id = result.frame_id,
                                tracks = result.tracks.len(),
                                detections = result.detections.len(),
                                "Progress"
                            );
                        }
                    }
                    ResultStatus::Stopped => break,
                    other => {
                        failed += 1;
                        warn!(frame_id = next_id, status = ?other, "Frame did not complete");
                    }
                }
                next_id += 1;
                if frames > 0 && next_id >= frames {
                    break;
                }
            }
            (success, failed)
        })
    };

    // Writer: submit synthetic frames at the configured rate.
    let writer = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut submitted: u64 = 0;
            let mut rejected: u64 = 0;
            let mut tick: u64 = 0;
            loop {
                if frames > 0 && submitted >= frames {
                    break;
                }
                let image = synthetic_frame(width, height, tick);
                tick += 1;
                match pipeline.submit_move(image).await {
                    Ok(_) => submitted += 1,
                    Err(highway_pipeline::PipelineError::Backpressured) => {
                        rejected += 1;
                        warn!("Backpressured, retrying");
                    }
                    Err(_) => break,
                }
                tokio::time::sleep(interval).await;
            }
            (submitted, rejected)
        })
    };

    let shutdown_pipeline = pipeline.clone();
    tokio::select! {
        _ = shutdown_signal() => {
            shutdown_pipeline.stop().await;
        }
        result = writer => {
            let (submitted, rejected) = result?;
            info!(submitted, rejected, "All frames submitted");
            let (success, failed) = reader.await?;
            info!(success, failed, "All results collected");
            println!("{}", pipeline.status_string());
            pipeline.stop().await;
            return Ok(());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    let config = PipelineConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Falling back to default configuration");
        PipelineConfig::default()
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        segmentation_threads = config.segmentation_threads,
        detection_threads = config.detection_threads,
        ready_batch_cap = config.ready_batch_cap,
        "Starting highway pipeline"
    );

    match cli.command {
        Commands::Run {
            frames,
            width,
            height,
            interval_ms,
            detect_only,
        } => {
            let mut config = config;
            if detect_only {
                config.enable_tracking = false;
                config.enable_event_determine = false;
            }
            run_demo(
                config,
                frames,
                width,
                height,
                Duration::from_millis(interval_ms),
            )
            .await?;
        }

        Commands::Config => {
            println!("{:#?}", config);
        }
    }

    Ok(())
}
