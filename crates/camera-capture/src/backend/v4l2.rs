//! V4L2 mmap-streaming backend
//!
//! The primary backend on the rig. Driver buffer timestamps are on
//! CLOCK_MONOTONIC and are surfaced for reconciliation against the time
//! base.

use super::{CameraBackend, RawFrame};
use crate::{CameraConfig, CameraError};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value as ControlValue};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Backend {
    // The stream borrows the device, so the device is boxed and kept alive
    // behind a raw pointer until the stream has been dropped in close().
    device: Option<*mut Device>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
}

// The raw device pointer is only touched from the owning thread; the type
// is moved, never shared.
unsafe impl Send for V4l2Backend {}

impl V4l2Backend {
    pub fn new() -> Self {
        Self {
            device: None,
            stream: None,
            width: 0,
            height: 0,
        }
    }

    fn apply_controls(device: &Device, config: &CameraConfig) {
        let controls = match device.query_controls() {
            Ok(c) => c,
            Err(e) => {
                warn!("control enumeration failed: {}", e);
                return;
            }
        };
        for desc in controls {
            let name = desc.name.to_lowercase();
            let wanted = if name.contains("exposure") && !name.contains("auto") {
                config.exposure
            } else if name.contains("gain") && !name.contains("auto") {
                config.gain
            } else if name.contains("white balance") && name.contains("auto") {
                Some(i64::from(config.auto_white_balance))
            } else {
                None
            };
            let Some(value) = wanted else { continue };
            let control = Control {
                id: desc.id,
                value: ControlValue::Integer(value),
            };
            match device.set_control(control) {
                Ok(()) => debug!(control = %desc.name, value, "control applied"),
                Err(e) => warn!(control = %desc.name, "control rejected: {}", e),
            }
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for V4l2Backend {
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        self.close();

        let mut device = Device::with_path(&config.device)
            .map_err(|e| CameraError::Open(format!("{}: {}", config.device, e)))?;

        let requested = Format::new(config.width, config.height, FourCC::new(b"MJPG"));
        let format = device
            .set_format(&requested)
            .map_err(|e| CameraError::Format(e.to_string()))?;
        if &format.fourcc.repr != b"MJPG" {
            return Err(CameraError::Format(format!(
                "device refused MJPG, offered {}",
                format.fourcc
            )));
        }
        self.width = format.width;
        self.height = format.height;

        Self::apply_controls(&device, config);

        // The stream borrows the device for 'static; the box is reclaimed in
        // close() once the stream has been dropped.
        let device_ptr: *mut Device = Box::into_raw(Box::new(device));
        let stream = MmapStream::with_buffers(
            unsafe { &*device_ptr },
            Type::VideoCapture,
            BUFFER_COUNT,
        )
        .map_err(|e| {
            unsafe { drop(Box::from_raw(device_ptr)) };
            CameraError::Open(format!("stream setup: {}", e))
        })?;

        self.device = Some(device_ptr);
        self.stream = Some(stream);
        info!(
            device = %config.device,
            width = self.width,
            height = self.height,
            "v4l2 stream open"
        );
        Ok(())
    }

    fn grab(&mut self) -> Result<RawFrame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotInitialized)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::Capture(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(CameraError::Capture("empty buffer".to_string()));
        }

        // Drivers that do not stamp buffers report a zero timestamp.
        let ts = &meta.timestamp;
        let hw_timestamp_mono_ns = if ts.sec > 0 {
            Some(ts.sec as u64 * 1_000_000_000 + ts.usec as u64 * 1_000)
        } else {
            None
        };

        Ok(RawFrame {
            bytes: buf[..used].to_vec(),
            width: self.width,
            height: self.height,
            hw_timestamp_mono_ns,
        })
    }

    fn close(&mut self) {
        // Stream first: it still references the device mapping.
        self.stream = None;
        if let Some(ptr) = self.device.take() {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }

    fn name(&self) -> &'static str {
        "v4l2"
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        self.close();
    }
}
