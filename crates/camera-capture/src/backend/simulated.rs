//! Simulated backend for tests and dry runs

use super::{CameraBackend, RawFrame};
use crate::{CameraConfig, CameraError};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use timebase::monotonic_ns;
use tracing::debug;

/// Generates JPEG frames in memory, no hardware required.
///
/// Frames carry a monotonic "hardware" timestamp so the reconciliation path
/// is exercised the same way as with the V4L2 backend.
pub struct SimulatedBackend {
    opened: bool,
    width: u32,
    height: u32,
    frame_index: u64,
    /// Fixed luma override; None renders a moving gradient.
    solid_luma: Option<u8>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            opened: false,
            width: 0,
            height: 0,
            frame_index: 0,
            solid_luma: None,
        }
    }

    /// Emit uniform frames of the given luma, e.g. 255 to trigger the
    /// overexposure warning path.
    pub fn with_solid_luma(luma: u8) -> Self {
        Self {
            solid_luma: Some(luma),
            ..Self::new()
        }
    }

    fn render(&self) -> Result<Vec<u8>, CameraError> {
        let img = match self.solid_luma {
            Some(luma) => RgbImage::from_pixel(self.width, self.height, Rgb([luma, luma, luma])),
            None => RgbImage::from_fn(self.width, self.height, |x, y| {
                let shift = (self.frame_index % 256) as u32;
                Rgb([
                    ((x + shift) % 256) as u8,
                    ((y + shift) % 256) as u8,
                    ((x + y) % 256) as u8,
                ])
            }),
        };
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .map_err(|e| CameraError::Capture(e.to_string()))?;
        Ok(out)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for SimulatedBackend {
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        self.width = config.width.max(1);
        self.height = config.height.max(1);
        self.opened = true;
        debug!(width = self.width, height = self.height, "simulated camera open");
        Ok(())
    }

    fn grab(&mut self) -> Result<RawFrame, CameraError> {
        if !self.opened {
            return Err(CameraError::NotInitialized);
        }
        let bytes = self.render()?;
        self.frame_index += 1;
        Ok(RawFrame {
            bytes,
            width: self.width,
            height: self.height,
            hw_timestamp_mono_ns: Some(monotonic_ns()),
        })
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
