//! Camera source state machine and timestamp policy

use crate::backend::CameraBackend;
use crate::{CameraConfig, CameraError, CameraFrame};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use timebase::{PpsClock, TimeBase};
use tracing::{debug, info, warn};

/// Attempts at a throwaway test capture during initialization.
const INIT_TEST_ATTEMPTS: u32 = 3;

/// Mean luma at or above which a test frame counts as severely overexposed.
const OVEREXPOSURE_LUMA: f64 = 250.0;

/// Camera source state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Owns the capture backend and attaches timestamps to frames.
///
/// The timestamp read happens immediately after the frame read: that gap is
/// the dominant contributor to pipeline timing accuracy. Driver timestamps
/// are used when the backend provides them, translated through the time
/// base; otherwise the time base supplies a software timestamp (PPS-refined
/// when a locked source is configured).
pub struct CameraSource {
    backend: Box<dyn CameraBackend>,
    config: CameraConfig,
    timebase: Arc<TimeBase>,
    pps: Option<PpsClock>,
    state: CameraState,
    overexposure_warning: bool,
    last_timestamp: Option<DateTime<Utc>>,
    missed_frames: u64,
}

impl CameraSource {
    pub fn new(
        backend: Box<dyn CameraBackend>,
        config: CameraConfig,
        timebase: Arc<TimeBase>,
    ) -> Self {
        Self {
            backend,
            config,
            timebase,
            pps: None,
            state: CameraState::Uninitialized,
            overexposure_warning: false,
            last_timestamp: None,
            missed_frames: 0,
        }
    }

    /// Attach a PPS source for software-timestamp refinement.
    pub fn with_pps(mut self, pps: PpsClock) -> Self {
        self.pps = Some(pps);
        self
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    /// Persistent health flag: the last initialization saw a severely
    /// overexposed test frame. Capture continues; the cause is environmental.
    pub fn overexposure_warning(&self) -> bool {
        self.overexposure_warning
    }

    /// Frames the backend failed to deliver since startup.
    pub fn missed_frames(&self) -> u64 {
        self.missed_frames
    }

    /// Open the device, apply configuration and confirm the pipeline with a
    /// throwaway test capture.
    pub fn initialize(&mut self) -> Result<(), CameraError> {
        self.state = CameraState::Initializing;
        info!(backend = self.backend.name(), "initializing camera");

        if let Err(e) = self.backend.open(&self.config) {
            self.state = CameraState::Failed;
            return Err(e);
        }

        let mut test_frame = None;
        for attempt in 1..=INIT_TEST_ATTEMPTS {
            match self.backend.grab() {
                Ok(frame) => {
                    test_frame = Some(frame);
                    break;
                }
                Err(e) => {
                    warn!(attempt, "test capture failed: {}", e);
                }
            }
        }
        let Some(frame) = test_frame else {
            self.backend.close();
            self.state = CameraState::Failed;
            return Err(CameraError::TestCapture(INIT_TEST_ATTEMPTS));
        };

        self.overexposure_warning = match mean_luma(&frame.bytes) {
            Some(luma) if luma >= OVEREXPOSURE_LUMA => {
                warn!(mean_luma = luma, "test frame severely overexposed, continuing");
                true
            }
            Some(_) => false,
            None => false,
        };

        self.state = CameraState::Ready;
        info!(backend = self.backend.name(), "camera ready");
        Ok(())
    }

    /// Capture one frame and stamp it.
    ///
    /// Returns `None` on a single missed frame; transient misses are
    /// expected and left to the orchestrator's retry accounting.
    pub fn capture_frame_with_timestamp(&mut self) -> Option<CameraFrame> {
        if self.state != CameraState::Ready {
            return None;
        }

        let raw = match self.backend.grab() {
            Ok(raw) => raw,
            Err(e) => {
                self.missed_frames += 1;
                debug!("frame miss: {}", e);
                return None;
            }
        };

        // Stamp immediately after the read returns. A locked PPS source
        // also corrects hardware-derived timestamps, since the offset they
        // go through carries the same sub-second clock error.
        let timestamp = match raw
            .hw_timestamp_mono_ns
            .and_then(|ns| self.timebase.monotonic_to_utc(ns))
        {
            Some(ts) => match &self.pps {
                Some(pps) if pps.is_locked() => pps.refine(ts),
                _ => ts,
            },
            None => self.timebase.now_for_capture(self.pps.as_ref()),
        };
        let timestamp = self.clamp_non_decreasing(timestamp);

        Some(CameraFrame {
            jpeg: raw.bytes,
            width: raw.width,
            height: raw.height,
            timestamp_utc: timestamp,
            params: self.config.params(),
        })
    }

    /// Release the handle and run initialization again. Each call is a
    /// fresh, independent attempt.
    pub fn reconnect(&mut self) -> Result<(), CameraError> {
        info!(backend = self.backend.name(), "reconnecting camera");
        self.backend.close();
        self.state = CameraState::Uninitialized;
        self.initialize()
    }

    /// Release the device handle.
    pub fn shutdown(&mut self) {
        self.backend.close();
        self.state = CameraState::Uninitialized;
    }

    /// Successive frames from one session never move backwards, even if the
    /// underlying clock was stepped between reads.
    fn clamp_non_decreasing(&mut self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_timestamp {
            Some(last) if ts < last => last,
            _ => ts,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Mean luma of a JPEG, or `None` if it does not decode.
fn mean_luma(jpeg: &[u8]) -> Option<f64> {
    let img = image::load_from_memory(jpeg).ok()?.to_luma8();
    if img.is_empty() {
        return None;
    }
    Some(img.pixels().map(|p| p.0[0] as f64).sum::<f64>() / img.len() as f64)
}
