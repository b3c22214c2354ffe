//! System clock adjustment seam

use crate::ClockError;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::info;

/// Settable system clock.
///
/// GPS time sync steps the wall clock through this trait so tests can inject
/// a recording fake instead of requiring CAP_SYS_TIME.
pub trait SystemClock: Send + Sync {
    /// Step the system clock to the given instant.
    fn set(&self, to: DateTime<Utc>) -> Result<(), ClockError>;
}

/// Real system clock backed by `clock_settime(CLOCK_REALTIME)`.
///
/// Requires CAP_SYS_TIME; on the rig the service runs as root.
pub struct RealtimeClock;

impl SystemClock for RealtimeClock {
    fn set(&self, to: DateTime<Utc>) -> Result<(), ClockError> {
        let ts = libc::timespec {
            tv_sec: to.timestamp() as libc::time_t,
            tv_nsec: to.timestamp_subsec_nanos() as libc::c_long,
        };
        let ret = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(ClockError::SetClock(err.to_string()));
        }
        info!("system clock stepped to {}", to);
        Ok(())
    }
}

/// Recording fake for tests: stores every requested step, never touches the
/// real clock.
#[derive(Default)]
pub struct FakeClock {
    sets: Mutex<Vec<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// All instants the clock was asked to step to, in order.
    pub fn sets(&self) -> Vec<DateTime<Utc>> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SystemClock for FakeClock {
    fn set(&self, to: DateTime<Utc>) -> Result<(), ClockError> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner()).push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_records_steps() {
        let clock = FakeClock::new();
        let t = Utc::now();
        clock.set(t).unwrap();
        assert_eq!(clock.sets(), vec![t]);
    }
}
