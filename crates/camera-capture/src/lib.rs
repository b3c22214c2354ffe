//! Camera Capture for the Seabed Imaging Rig
//!
//! Encapsulates device acquisition, reconnect policy and timestamp
//! attachment behind one capability interface. Backends:
//! - V4L2 mmap streaming (primary, provides driver timestamps)
//! - fswebcam subprocess (field fallback when the V4L2 path misbehaves)
//! - simulated frames (tests and bench runs, no hardware)

pub mod backend;
pub mod source;

pub use backend::{create_backend, BackendKind, CameraBackend, RawFrame, SimulatedBackend};
pub use source::{CameraSource, CameraState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Camera error types
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Test capture produced no frame after {0} attempts")]
    TestCapture(u32),

    #[error("Camera not initialized")]
    NotInitialized,
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Capture(err.to_string())
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture backend selected at startup
    pub backend: BackendKind,
    /// Device path (e.g. "/dev/video0")
    pub device: String,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Driver-side frame rate hint
    pub fps: u32,
    /// Manual exposure value, None = auto
    pub exposure: Option<i64>,
    /// Manual gain value, None = auto
    pub gain: Option<i64>,
    /// Automatic white balance
    pub auto_white_balance: bool,
    /// EXIF Make field
    pub make: String,
    /// EXIF Model field
    pub model: String,
    /// EXIF Copyright field
    pub copyright: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::V4l2,
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            fps: 10,
            exposure: None,
            gain: None,
            auto_white_balance: true,
            make: "OceanCam".to_string(),
            model: "OC-1000".to_string(),
            copyright: "Seabed Survey Project".to_string(),
        }
    }
}

impl CameraConfig {
    /// Parameter snapshot taken at capture time, handed to the EXIF tagger.
    pub fn params(&self) -> CameraParams {
        CameraParams {
            make: self.make.clone(),
            model: self.model.clone(),
            copyright: self.copyright.clone(),
            exposure: self.exposure.map(|e| e.to_string()),
            gain: self.gain.map(|g| g.to_string()),
            white_balance: if self.auto_white_balance {
                "auto".to_string()
            } else {
                "manual".to_string()
            },
        }
    }
}

/// Camera parameter snapshot embedded in image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraParams {
    pub make: String,
    pub model: String,
    pub copyright: String,
    pub exposure: Option<String>,
    pub gain: Option<String>,
    pub white_balance: String,
}

/// One captured frame with its capture timestamp.
///
/// Owned exclusively by the caller for the duration of one tick; consumed by
/// the tagging/storage step, never retained.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// JPEG bytes as produced by the backend
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture instant, hardware timestamp when available
    pub timestamp_utc: DateTime<Utc>,
    /// Parameter snapshot read at call time
    pub params: CameraParams,
}
