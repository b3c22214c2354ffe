//! Kernel PPS (pulse-per-second) refinement
//!
//! Reads pulse assert timestamps from the sysfs interface exposed by the
//! `pps-gpio` driver (`/sys/class/pps/ppsN/assert`). The pulse marks a whole
//! UTC second, so the fractional part of the assert timestamp is the system
//! clock's sub-second error at the pulse edge.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Maximum assert age before the source is considered unlocked.
const LOCK_WINDOW_SECS: i64 = 2;

/// A single PPS pulse assert event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpsPulse {
    /// System clock timestamp of the pulse edge.
    pub asserted_at: DateTime<Utc>,
    /// Kernel event sequence number.
    pub sequence: u64,
}

/// Sysfs-backed PPS reader.
pub struct PpsClock {
    assert_path: PathBuf,
}

impl PpsClock {
    /// PPS source by index, e.g. 0 for `/dev/pps0`.
    pub fn new(index: u32) -> Self {
        Self {
            assert_path: PathBuf::from(format!("/sys/class/pps/pps{}/assert", index)),
        }
    }

    /// PPS source from an explicit assert file path (tests).
    pub fn with_assert_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            assert_path: path.as_ref().to_path_buf(),
        }
    }

    /// Whether the sysfs node exists at all.
    pub fn is_available(&self) -> bool {
        self.assert_path.exists()
    }

    /// Latest pulse, if the node is readable and has fired at least once.
    pub fn latest_pulse(&self) -> Option<PpsPulse> {
        let raw = std::fs::read_to_string(&self.assert_path).ok()?;
        parse_assert(raw.trim())
    }

    /// Locked means a pulse arrived within the last couple of seconds.
    pub fn is_locked(&self) -> bool {
        match self.latest_pulse() {
            Some(pulse) => {
                let age = Utc::now().signed_duration_since(pulse.asserted_at);
                age.num_seconds().abs() <= LOCK_WINDOW_SECS
            }
            None => false,
        }
    }

    /// Refine a timestamp by removing the sub-second clock error measured at
    /// the last pulse edge.
    pub fn refine(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let Some(pulse) = self.latest_pulse() else {
            return ts;
        };
        let nanos = pulse.asserted_at.timestamp_subsec_nanos() as i64;
        // The pulse fired on a whole second; anything past (or short of) it
        // is clock error.
        let error_ns = if nanos > 500_000_000 {
            nanos - 1_000_000_000
        } else {
            nanos
        };
        debug!(error_ns, "pps refinement applied");
        ts - ChronoDuration::nanoseconds(error_ns)
    }
}

/// Parse a sysfs assert line of the form `1714056391.000000312#1234`.
fn parse_assert(line: &str) -> Option<PpsPulse> {
    let (stamp, seq) = line.split_once('#')?;
    let (secs, nanos) = stamp.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = nanos.parse().ok()?;
    let sequence: u64 = seq.parse().ok()?;
    let asserted_at = Utc.timestamp_opt(secs, nanos).single()?;
    Some(PpsPulse {
        asserted_at,
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assert_line() {
        let pulse = parse_assert("1714056391.000000312#42").unwrap();
        assert_eq!(pulse.sequence, 42);
        assert_eq!(pulse.asserted_at.timestamp(), 1714056391);
        assert_eq!(pulse.asserted_at.timestamp_subsec_nanos(), 312);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_assert("").is_none());
        assert!(parse_assert("not-a-pulse").is_none());
        assert!(parse_assert("123.456").is_none());
    }

    #[test]
    fn test_missing_node_is_not_locked() {
        let pps = PpsClock::with_assert_path("/nonexistent/pps/assert");
        assert!(!pps.is_available());
        assert!(!pps.is_locked());
        assert!(pps.latest_pulse().is_none());
    }

    #[test]
    fn test_refine_removes_subsecond_error() {
        use std::io::Write;

        let dir = std::env::temp_dir().join("pps-refine-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("assert");
        // Pulse observed 312ns after the whole second: clock runs fast.
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "1714056391.000000312#7").unwrap();

        let pps = PpsClock::with_assert_path(&path);
        let ts = Utc.timestamp_opt(1714056391, 500_000_312).single().unwrap();
        let refined = pps.refine(ts);
        assert_eq!(refined.timestamp_subsec_nanos(), 500_000_000);

        std::fs::remove_file(&path).ok();
    }
}
