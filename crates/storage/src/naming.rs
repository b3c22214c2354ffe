//! Per-day sequence numbering and filename derivation
//!
//! The filename format `{prefix}_{YYYYMMDD}-{HHMMSS}-{mmm}_{NNNNN}.jpg` is a
//! persisted contract other tooling depends on. The counter, not the
//! timestamp, is the uniqueness guarantee: two frames in the same
//! millisecond still get distinct names.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::path::Path;
use tracing::{info, warn};

/// Assigns a per-day monotonically increasing sequence number and derives
/// collision-free filenames. Single writer: only the capture tick touches it.
#[derive(Debug)]
pub struct SequenceNamer {
    prefix: String,
    counter: u32,
    active_date: Option<NaiveDate>,
}

impl SequenceNamer {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: 0,
            active_date: None,
        }
    }

    /// Next filename for a capture at `timestamp`. Resets to 1 on the first
    /// call of a new calendar day, otherwise strictly increments. Pure
    /// function of internal state + input; never fails.
    pub fn next_name(&mut self, timestamp: DateTime<Utc>) -> (String, u32) {
        let date = timestamp.date_naive();
        if self.active_date != Some(date) {
            if let Some(previous) = self.active_date {
                info!(
                    from = %previous,
                    to = %date,
                    "date rolled over, sequence reset"
                );
            }
            self.active_date = Some(date);
            self.counter = 0;
        }
        self.counter += 1;

        let name = format!(
            "{}_{}-{}-{:03}_{:05}.jpg",
            self.prefix,
            timestamp.format("%Y%m%d"),
            timestamp.format("%H%M%S"),
            timestamp.timestamp_subsec_millis(),
            self.counter,
        );
        (name, self.counter)
    }

    /// Current counter value (0 before the first assignment of the day).
    pub fn current(&self) -> u32 {
        self.counter
    }

    /// Seed the counter from files already present in a day partition, so a
    /// mid-day restart cannot reuse sequence numbers from the previous run.
    pub fn recover(&mut self, partition: &Path, date: NaiveDate) {
        let entries = match std::fs::read_dir(partition) {
            Ok(entries) => entries,
            Err(_) => return, // nothing captured today yet
        };

        let mut highest = 0u32;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(seq) = parse_sequence(name, &self.prefix) {
                highest = highest.max(seq);
            }
        }

        if highest > 0 {
            warn!(
                partition = %partition.display(),
                resume_from = highest + 1,
                "recovered sequence counter from existing files"
            );
            self.active_date = Some(date);
            self.counter = highest;
        }
    }
}

/// Extract the `NNNNN` suffix from `{prefix}_{date}-{time}-{ms}_{NNNNN}.jpg`.
fn parse_sequence(filename: &str, prefix: &str) -> Option<u32> {
    let rest = filename.strip_prefix(prefix)?.strip_prefix('_')?;
    let stem = rest.strip_suffix(".jpg")?;
    let (_, seq) = stem.rsplit_once('_')?;
    seq.parse().ok()
}

/// Day partition name for a capture date: `YYYYMMDD`.
pub fn partition_name(date: NaiveDate) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month(), date.day())
}
