//! Capture backends behind one capability interface

mod fswebcam;
mod simulated;
#[cfg(target_os = "linux")]
mod v4l2;

pub use fswebcam::FswebcamBackend;
pub use simulated::SimulatedBackend;
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;

use crate::{CameraConfig, CameraError};
use serde::{Deserialize, Serialize};

/// Backend selection, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    V4l2,
    Fswebcam,
    Simulated,
}

/// A frame as delivered by a backend, before timestamp reconciliation.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// JPEG bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver timestamp on the monotonic clock, when the backend has one
    pub hw_timestamp_mono_ns: Option<u64>,
}

/// Capture backend capability interface.
///
/// All three implementations are interchangeable; [`crate::CameraSource`]
/// owns the state machine and timestamp policy on top.
pub trait CameraBackend: Send {
    /// Open the device and apply resolution/format/exposure configuration.
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError>;

    /// Read one frame. Blocks for a bounded duration.
    fn grab(&mut self) -> Result<RawFrame, CameraError>;

    /// Release the device handle. Safe to call repeatedly.
    fn close(&mut self);

    fn name(&self) -> &'static str;
}

/// Instantiate the backend named by the configuration.
pub fn create_backend(kind: BackendKind) -> Result<Box<dyn CameraBackend>, CameraError> {
    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::V4l2 => Ok(Box::new(V4l2Backend::new())),
        #[cfg(not(target_os = "linux"))]
        BackendKind::V4l2 => Err(CameraError::Open(
            "v4l2 backend is only available on linux".to_string(),
        )),
        BackendKind::Fswebcam => Ok(Box::new(FswebcamBackend::new())),
        BackendKind::Simulated => Ok(Box::new(SimulatedBackend::new())),
    }
}
