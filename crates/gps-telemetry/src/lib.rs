//! GPS Telemetry
//!
//! Maintains the rig's best-known position/time fix from a serial NMEA
//! stream, non-blocking for the capture path:
//! - current-fix snapshot store with read-time staleness enforcement
//! - fix validity rules for EXIF tagging decisions
//! - GPS-driven system clock sync coupled to the capture time base

pub mod fix;
pub mod source;
pub mod timesync;

pub use fix::{FixStore, GpsFix, FIX_STALE_AFTER};
pub use source::{GpsConfig, GpsSource, GpsState};
pub use timesync::TimeSync;

use thiserror::Error;

/// GPS error types
#[derive(Debug, Error)]
pub enum GpsError {
    #[error("Failed to open GPS port {port}: {source}")]
    Open {
        port: String,
        source: tokio_serial::Error,
    },

    #[error("Serial read error: {0}")]
    Read(String),

    #[error("GPS port not connected")]
    NotConnected,

    #[error("No valid GPS fix within {0:?}")]
    FixTimeout(std::time::Duration),
}

impl From<std::io::Error> for GpsError {
    fn from(err: std::io::Error) -> Self {
        GpsError::Read(err.to_string())
    }
}
