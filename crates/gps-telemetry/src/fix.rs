//! GPS fix snapshot and shared store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A fix with no update for this long is reported as absent.
pub const FIX_STALE_AFTER: Duration = Duration::from_secs(10);

/// A single GPS position/time fix.
///
/// Immutable once constructed; shared between the GPS loop and the capture
/// loop as an `Arc` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// GGA fix quality, 0 = no fix.
    pub fix_quality: u8,
    pub satellites_used: u32,
    pub hdop: Option<f32>,
    pub timestamp_utc: DateTime<Utc>,
}

impl GpsFix {
    /// A fix is usable for tagging iff it has quality, enough satellites and
    /// plausible coordinates. An all-zero fix is recorded but never valid.
    pub fn is_valid(&self) -> bool {
        self.fix_quality > 0
            && self.satellites_used >= 3
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Shared current-fix store.
///
/// Single writer (the GPS update loop), many readers. The stored value is a
/// copy-on-write `Arc<GpsFix>` so readers always see a complete snapshot.
/// Staleness is enforced at read time: hardware that silently stops
/// producing data must not leave a forever-fresh fix behind.
#[derive(Default)]
pub struct FixStore {
    current: Mutex<Option<(Arc<GpsFix>, Instant)>>,
}

impl FixStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Overwrite the current fix. Returns whether the fix changed.
    pub fn publish(&self, fix: GpsFix) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let changed = match current.as_ref() {
            Some((prev, _)) => **prev != fix,
            None => true,
        };
        *current = Some((Arc::new(fix), Instant::now()));
        changed
    }

    /// Current fix, or `None` if never set or stale.
    pub fn latest(&self) -> Option<Arc<GpsFix>> {
        self.latest_at(Instant::now())
    }

    /// Instant of the last update, regardless of staleness.
    pub fn last_update(&self) -> Option<Instant> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(|(_, at)| *at)
    }

    fn latest_at(&self, now: Instant) -> Option<Arc<GpsFix>> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let (fix, updated) = current.as_ref()?;
        if now.duration_since(*updated) > FIX_STALE_AFTER {
            return None;
        }
        Some(Arc::clone(fix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(quality: u8, sats: u32, lat: f64, lon: f64) -> GpsFix {
        GpsFix {
            latitude: lat,
            longitude: lon,
            altitude: None,
            fix_quality: quality,
            satellites_used: sats,
            hdop: None,
            timestamp_utc: Utc::now(),
        }
    }

    #[test]
    fn test_fix_validity() {
        assert!(fix(1, 4, 45.0, -122.0).is_valid());
        assert!(!fix(0, 0, 0.0, 0.0).is_valid());
        assert!(!fix(1, 2, 45.0, -122.0).is_valid());
        assert!(!fix(1, 4, 91.0, 0.0).is_valid());
        assert!(!fix(1, 4, 0.0, -181.0).is_valid());
    }

    #[test]
    fn test_store_staleness_enforced_at_read() {
        let store = FixStore::new();
        store.publish(fix(1, 5, 10.0, 20.0));
        let written = store.last_update().unwrap();

        // Present 5 seconds after the update...
        assert!(store.latest_at(written + Duration::from_secs(5)).is_some());
        // ...absent 11 seconds after, with no intervening update.
        assert!(store.latest_at(written + Duration::from_secs(11)).is_none());
    }

    #[test]
    fn test_store_empty_until_first_publish() {
        let store = FixStore::new();
        assert!(store.latest().is_none());
        assert!(store.last_update().is_none());
    }

    #[test]
    fn test_publish_reports_change() {
        let store = FixStore::new();
        assert!(store.publish(fix(1, 5, 10.0, 20.0)));
        // Re-publishing the same coordinates at the same timestamp is not a
        // change, but it does refresh staleness.
        let same = store.latest().unwrap().as_ref().clone();
        assert!(!store.publish(same));
        assert!(store.publish(fix(1, 5, 10.1, 20.0)));
    }
}
