//! Rig configuration
//!
//! One strongly-typed snapshot, loaded and validated once at startup.
//! Reload requires a restart; components never see a half-applied change.

use crate::OrchestratorError;
use camera_capture::CameraConfig;
use gps_telemetry::GpsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use storage::StorageConfig;

/// Highest supported capture rate.
pub const MAX_CAPTURE_FPS: f64 = 30.0;

/// Top-level rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Capture tick rate (frames per second), 0 < fps <= 30
    pub capture_fps: f64,
    /// Camera device and EXIF identity
    pub camera: CameraConfig,
    /// GPS serial source; absent means the rig runs untagged
    pub gps: Option<GpsConfig>,
    /// Storage tree and retention
    pub storage: StorageConfig,
    /// Use the kernel PPS source to refine software timestamps
    pub pps_enabled: bool,
    /// Seconds between status reports
    pub status_interval_secs: u64,
    /// Consecutive tick failures before a recovery attempt
    pub max_consecutive_failures: u32,
    /// Stop after this many capture ticks (diagnostic runs only)
    pub max_ticks: Option<u64>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            capture_fps: 1.0,
            camera: CameraConfig::default(),
            gps: None,
            storage: StorageConfig::default(),
            pps_enabled: false,
            status_interval_secs: 30,
            max_consecutive_failures: 10,
            max_ticks: None,
        }
    }
}

impl RigConfig {
    /// Load from a file plus `RIG__`-prefixed environment overrides, then
    /// validate. Invalid configuration fails fast, before any loop begins.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let config: RigConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("RIG").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field the loops rely on.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !self.capture_fps.is_finite() || self.capture_fps <= 0.0 {
            return Err(OrchestratorError::Config(format!(
                "capture_fps must be > 0, got {}",
                self.capture_fps
            )));
        }
        if self.capture_fps > MAX_CAPTURE_FPS {
            return Err(OrchestratorError::Config(format!(
                "capture_fps must be <= {}, got {}",
                MAX_CAPTURE_FPS, self.capture_fps
            )));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(OrchestratorError::Config(format!(
                "camera resolution must be non-zero, got {}x{}",
                self.camera.width, self.camera.height
            )));
        }
        if self.camera.fps == 0 {
            return Err(OrchestratorError::Config(
                "camera fps must be non-zero".to_string(),
            ));
        }
        if self.storage.filename_prefix.is_empty()
            || self.storage.filename_prefix.contains(['/', '_'])
        {
            return Err(OrchestratorError::Config(format!(
                "filename_prefix must be non-empty without '/' or '_', got {:?}",
                self.storage.filename_prefix
            )));
        }
        if self.storage.min_free_space_gb < 0.0 {
            return Err(OrchestratorError::Config(
                "min_free_space_gb must be >= 0".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(OrchestratorError::Config(
                "max_consecutive_failures must be >= 1".to_string(),
            ));
        }
        if let Some(gps) = &self.gps {
            if gps.baudrate == 0 {
                return Err(OrchestratorError::Config(
                    "gps baudrate must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Capture tick interval derived from `capture_fps`.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.capture_fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        RigConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_fps_rejected() {
        let mut cfg = RigConfig::default();
        cfg.capture_fps = 0.0;
        assert!(cfg.validate().is_err());

        cfg.capture_fps = 31.0;
        assert!(cfg.validate().is_err());

        cfg.capture_fps = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_resolution_rejected() {
        let mut cfg = RigConfig::default();
        cfg.camera.width = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_prefix_with_separator_rejected() {
        let mut cfg = RigConfig::default();
        cfg.storage.filename_prefix = "bad_prefix".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_frame_interval() {
        let mut cfg = RigConfig::default();
        cfg.capture_fps = 2.0;
        assert_eq!(cfg.frame_interval(), std::time::Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
capture_fps = 2.0
pps_enabled = true

[camera]
backend = "simulated"
device = "/dev/video2"
width = 640
height = 480
fps = 10
auto_white_balance = true
make = "OceanCam"
model = "OC-1000"
copyright = "Survey"

[gps]
port = "/dev/ttyACM0"
baudrate = 115200
require_fix = true
fix_timeout_secs = 60

[storage]
base_path = "/mnt/usb"
min_free_space_gb = 2.0
days_to_keep = 14
filename_prefix = "benthic"
"#
        )
        .unwrap();

        let cfg = RigConfig::load(&path).unwrap();
        assert_eq!(cfg.capture_fps, 2.0);
        assert!(cfg.pps_enabled);
        assert_eq!(cfg.camera.device, "/dev/video2");
        let gps = cfg.gps.expect("gps section present");
        assert_eq!(gps.baudrate, 115200);
        assert!(gps.require_fix);
        assert_eq!(cfg.storage.filename_prefix, "benthic");
        assert_eq!(cfg.storage.days_to_keep, 14);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(&path, "capture_fps = -1.0\n").unwrap();
        assert!(RigConfig::load(&path).is_err());
    }
}
