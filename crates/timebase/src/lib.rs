//! Time Base for Frame Timestamping
//!
//! Maintains a monotonic-to-UTC offset so capture timestamps stay consistent
//! even while the system clock is being stepped by GPS time sync. Optionally
//! refines timestamps with a kernel PPS source.

pub mod clock;
pub mod pps;

pub use clock::{RealtimeClock, SystemClock};
pub use pps::PpsClock;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Time base error types
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("Failed to set system clock: {0}")]
    SetClock(String),

    #[error("PPS source error: {0}")]
    Pps(String),
}

impl From<std::io::Error> for ClockError {
    fn from(err: std::io::Error) -> Self {
        ClockError::Pps(err.to_string())
    }
}

/// Read the raw monotonic clock in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC matches the clock V4L2 drivers stamp buffers with.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn utc_now_ns() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp().saturating_mul(1_000_000_000))
}

#[derive(Debug)]
struct Offset {
    monotonic_origin_ns: u64,
    utc_offset_ns: i64,
    last_sync: Option<DateTime<Utc>>,
}

/// Monotonic-to-UTC time base.
///
/// `sync()` captures the monotonic and wall clocks back-to-back and stores
/// their offset; `now()` and `monotonic_to_utc()` then derive UTC instants
/// from the monotonic clock alone. The offset is only trusted between two
/// syncs: after any system clock step it must be recomputed before use.
pub struct TimeBase {
    offset: Mutex<Offset>,
    resync_interval: Duration,
}

/// Default interval between periodic resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

impl TimeBase {
    /// Create an unsynced time base. Call [`TimeBase::sync`] at startup.
    pub fn new() -> Self {
        Self::with_resync_interval(DEFAULT_RESYNC_INTERVAL)
    }

    /// Create a time base with a custom periodic resync interval.
    pub fn with_resync_interval(resync_interval: Duration) -> Self {
        Self {
            offset: Mutex::new(Offset {
                monotonic_origin_ns: monotonic_ns(),
                utc_offset_ns: 0,
                last_sync: None,
            }),
            resync_interval,
        }
    }

    /// Recompute the monotonic-to-UTC offset.
    ///
    /// The two clock reads are back-to-back so the offset error stays within
    /// the cost of one clock call. Always succeeds.
    pub fn sync(&self) {
        let mono = monotonic_ns();
        let utc = utc_now_ns();

        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        offset.utc_offset_ns = utc - mono as i64;
        offset.last_sync = Some(Utc::now());
        debug!(offset_ns = offset.utc_offset_ns, "time base synced");
    }

    /// Best-available UTC now.
    ///
    /// Monotonic + offset once synced; before the first sync this falls back
    /// to a direct wall-clock read.
    pub fn now(&self) -> DateTime<Utc> {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        if offset.last_sync.is_none() {
            warn!("time base read before first sync, using wall clock");
            return Utc::now();
        }
        Utc.timestamp_nanos(monotonic_ns() as i64 + offset.utc_offset_ns)
    }

    /// Translate a monotonic timestamp (e.g. a V4L2 buffer timestamp) to UTC.
    ///
    /// Returns `None` before the first sync, since the offset is meaningless
    /// until then.
    pub fn monotonic_to_utc(&self, mono_ns: u64) -> Option<DateTime<Utc>> {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        offset.last_sync?;
        Some(Utc.timestamp_nanos(mono_ns as i64 + offset.utc_offset_ns))
    }

    /// Capture timestamp, refined by PPS when a locked source is supplied.
    pub fn now_for_capture(&self, pps: Option<&PpsClock>) -> DateTime<Utc> {
        let now = self.now();
        match pps {
            Some(p) if p.is_locked() => p.refine(now),
            _ => now,
        }
    }

    /// Whether the periodic resync interval has elapsed since the last sync.
    pub fn needs_resync(&self) -> bool {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        match offset.last_sync {
            None => true,
            Some(t) => {
                let age = Utc::now().signed_duration_since(t);
                age.to_std().map(|a| a >= self.resync_interval).unwrap_or(true)
            }
        }
    }

    /// Time of the last successful sync.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.offset.lock().unwrap_or_else(|e| e.into_inner()).last_sync
    }

    /// Monotonic origin captured at construction, for diagnostics.
    pub fn monotonic_origin_ns(&self) -> u64 {
        self.offset
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .monotonic_origin_ns
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_tracks_wall_clock_after_sync() {
        let tb = TimeBase::new();
        tb.sync();

        let derived = tb.now();
        let wall = Utc::now();
        let diff = (wall - derived).num_milliseconds().abs();
        assert!(diff < 100, "derived time off by {}ms", diff);
    }

    #[test]
    fn test_unsynced_falls_back_to_wall_clock() {
        let tb = TimeBase::new();
        let diff = (Utc::now() - tb.now()).num_milliseconds().abs();
        assert!(diff < 100);
        assert!(tb.last_sync().is_none());
    }

    #[test]
    fn test_monotonic_to_utc_requires_sync() {
        let tb = TimeBase::new();
        assert!(tb.monotonic_to_utc(monotonic_ns()).is_none());

        tb.sync();
        let mono = monotonic_ns();
        let utc = tb.monotonic_to_utc(mono).unwrap();
        let diff = (Utc::now() - utc).num_milliseconds().abs();
        assert!(diff < 100);
    }

    #[test]
    fn test_needs_resync_after_interval() {
        let tb = TimeBase::with_resync_interval(Duration::from_millis(0));
        assert!(tb.needs_resync());
        tb.sync();
        // Zero interval means a resync is due immediately.
        assert!(tb.needs_resync());

        let tb = TimeBase::new();
        tb.sync();
        assert!(!tb.needs_resync());
    }

    #[test]
    fn test_monotonic_is_nondecreasing() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
