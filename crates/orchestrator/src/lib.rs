//! Capture Orchestrator
//!
//! Drives the fixed-rate capture tick and keeps the rig alive through
//! partial failures: camera misses are counted and skipped, GPS loss
//! degrades to fallback tagging, and only mandatory-dependency exhaustion
//! (camera or storage gone for good) stops the process.

pub mod config;
pub mod orchestrator;
pub mod stats;
pub mod status;

pub use crate::config::RigConfig;
pub use crate::orchestrator::{CaptureOrchestrator, OrchestratorContext, RunSummary};
pub use crate::stats::Stats;
pub use crate::status::{ChannelSink, LogSink, StatusReport, StatusSink};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Orchestrator error types. Everything here is fatal; transient conditions
/// are handled inside the tick loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera error: {0}")]
    Camera(#[from] camera_capture::CameraError),

    #[error("GPS error: {0}")]
    Gps(#[from] gps_telemetry::GpsError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Mandatory component down: {component} ({details})")]
    MandatoryComponentDown {
        component: &'static str,
        details: String,
    },
}

impl From<::config::ConfigError> for OrchestratorError {
    fn from(err: ::config::ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

/// Initialize logging
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
