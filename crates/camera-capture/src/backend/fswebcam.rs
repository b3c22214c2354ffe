//! fswebcam subprocess backend
//!
//! Shells out to `fswebcam` for each frame. Much slower than the V4L2 path
//! and without driver timestamps, but it survives UVC quirks that wedge
//! mmap streaming on some hubs, so it stays available as a field fallback.

use super::{CameraBackend, RawFrame};
use crate::{CameraConfig, CameraError};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

const JPEG_QUALITY: u32 = 90;

pub struct FswebcamBackend {
    config: Option<CameraConfig>,
    scratch: PathBuf,
}

impl FswebcamBackend {
    pub fn new() -> Self {
        Self {
            config: None,
            scratch: std::env::temp_dir().join(format!("rig-fswebcam-{}.jpg", std::process::id())),
        }
    }
}

impl Default for FswebcamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for FswebcamBackend {
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        // No persistent handle: the subprocess opens the device per frame.
        // Verify the binary exists so initialization fails fast.
        let probe = Command::new("fswebcam").arg("--version").output();
        match probe {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                warn!("fswebcam --version exited with {}", out.status);
            }
            Err(e) => {
                return Err(CameraError::Open(format!("fswebcam not runnable: {}", e)));
            }
        }
        info!(device = %config.device, "fswebcam backend ready");
        self.config = Some(config.clone());
        Ok(())
    }

    fn grab(&mut self) -> Result<RawFrame, CameraError> {
        let config = self.config.as_ref().ok_or(CameraError::NotInitialized)?;

        let mut cmd = Command::new("fswebcam");
        cmd.arg("-d")
            .arg(&config.device)
            .arg("-r")
            .arg(format!("{}x{}", config.width, config.height))
            .arg("--no-banner")
            .arg("--jpeg")
            .arg(JPEG_QUALITY.to_string());
        if let Some(exposure) = config.exposure {
            cmd.arg("-s").arg(format!("Exposure (Absolute)={}", exposure));
        }
        if let Some(gain) = config.gain {
            cmd.arg("-s").arg(format!("Gain={}", gain));
        }
        cmd.arg(&self.scratch);

        let output = cmd.output().map_err(|e| CameraError::Capture(e.to_string()))?;
        if !output.status.success() {
            return Err(CameraError::Capture(format!(
                "fswebcam exited with {}",
                output.status
            )));
        }

        let bytes = std::fs::read(&self.scratch)?;
        if bytes.is_empty() {
            return Err(CameraError::Capture("fswebcam wrote an empty file".to_string()));
        }
        debug!(len = bytes.len(), "fswebcam frame read");

        Ok(RawFrame {
            bytes,
            width: config.width,
            height: config.height,
            hw_timestamp_mono_ns: None,
        })
    }

    fn close(&mut self) {
        self.config = None;
        std::fs::remove_file(&self.scratch).ok();
    }

    fn name(&self) -> &'static str {
        "fswebcam"
    }
}
