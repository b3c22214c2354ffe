//! GPS-driven system clock sync
//!
//! When a sentence carries both date and time, the GPS time is compared to
//! the system clock at a bounded interval; a large discrepancy steps the
//! clock and immediately resyncs the capture time base so the next frame
//! never sees a stale offset.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timebase::{SystemClock, TimeBase};
use tracing::{debug, info, warn};

/// Minimum interval between clock comparisons after the first fix.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Discrepancy beyond which the system clock is stepped.
pub const STEP_THRESHOLD_MS: i64 = 1000;

/// Couples GPS time to the system clock and the capture time base.
pub struct TimeSync {
    clock: Arc<dyn SystemClock>,
    timebase: Arc<TimeBase>,
    interval: Duration,
    last_compared: Option<Instant>,
    corrections: u64,
}

impl TimeSync {
    pub fn new(clock: Arc<dyn SystemClock>, timebase: Arc<TimeBase>) -> Self {
        Self::with_interval(clock, timebase, SYNC_INTERVAL)
    }

    pub fn with_interval(
        clock: Arc<dyn SystemClock>,
        timebase: Arc<TimeBase>,
        interval: Duration,
    ) -> Self {
        Self {
            clock,
            timebase,
            interval,
            last_compared: None,
            corrections: 0,
        }
    }

    /// Compare GPS time to the system clock and step it if they disagree by
    /// more than a second. Returns whether a correction was applied.
    ///
    /// The comparison runs on the first fix ever received and then at most
    /// once per interval. Clock-step and time base resync happen before the
    /// caller publishes the fix, so the two are atomic with respect to a
    /// single fix event.
    pub fn maybe_sync(&mut self, gps_time: DateTime<Utc>) -> bool {
        let due = match self.last_compared {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if !due {
            return false;
        }
        self.last_compared = Some(Instant::now());

        let delta_ms = (gps_time - Utc::now()).num_milliseconds();
        if delta_ms.abs() <= STEP_THRESHOLD_MS {
            debug!(delta_ms, "gps/system clock agree, no step");
            return false;
        }

        info!(delta_ms, "stepping system clock from gps time");
        if let Err(e) = self.clock.set(gps_time) {
            warn!("clock step failed: {}", e);
            return false;
        }
        // The old monotonic-to-UTC offset is invalid the instant the clock
        // jumps; recompute before anything timestamps another frame.
        self.timebase.sync();
        self.corrections += 1;
        true
    }

    /// Number of corrections applied since startup.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }
}
