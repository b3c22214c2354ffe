//! Running capture statistics

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
struct Counters {
    images_captured: u64,
    errors: u64,
    last_gps_fix_time: Option<DateTime<Utc>>,
}

/// Shared statistics: written by the capture tick, read by the status loop.
/// Reset only by process restart.
pub struct Stats {
    start_time: DateTime<Utc>,
    started: Instant,
    counters: Mutex<Counters>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            counters: Mutex::new(Counters {
                images_captured: 0,
                errors: 0,
                last_gps_fix_time: None,
            }),
        }
    }

    pub fn record_capture(&self) {
        self.lock().images_captured += 1;
    }

    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn record_gps_fix(&self, at: DateTime<Utc>) {
        self.lock().last_gps_fix_time = Some(at);
    }

    pub fn images_captured(&self) -> u64 {
        self.lock().images_captured
    }

    pub fn errors(&self) -> u64 {
        self.lock().errors
    }

    pub fn last_gps_fix_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_gps_fix_time
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Achieved capture rate since startup.
    pub fn fps_actual(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.images_captured() as f64 / elapsed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.record_capture();
        stats.record_capture();
        stats.record_error();

        assert_eq!(stats.images_captured(), 2);
        assert_eq!(stats.errors(), 1);
        assert!(stats.last_gps_fix_time().is_none());

        let now = Utc::now();
        stats.record_gps_fix(now);
        assert_eq!(stats.last_gps_fix_time(), Some(now));
    }

    #[test]
    fn test_fps_actual_counts_captures_only() {
        let stats = Stats::new();
        assert_eq!(stats.fps_actual(), 0.0);
        stats.record_error();
        assert_eq!(stats.fps_actual(), 0.0);
    }
}
