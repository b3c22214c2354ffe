//! Durable image writes with space accounting

use crate::naming::partition_name;
use crate::StorageError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGES_DIR: &str = "images";
const PROBE_FILE: &str = ".rig-write-probe";

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Mount point of the USB storage
    pub base_path: PathBuf,
    /// Refuse writes (after cleanup) below this much free space
    pub min_free_space_gb: f64,
    /// Partitions older than this are eligible for cleanup; 0 disables
    /// cleanup entirely
    pub days_to_keep: u32,
    /// Filename prefix, part of the on-disk contract
    pub filename_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/mnt/usb"),
            min_free_space_gb: 1.0,
            days_to_keep: 30,
            filename_prefix: "rig".to_string(),
        }
    }
}

/// Writes image bytes to the date-partitioned tree under
/// `{base}/images/{YYYYMMDD}/`.
pub struct StorageSink {
    config: StorageConfig,
    cleanups: u64,
}

impl StorageSink {
    /// Validate the base path and create the image root.
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let images = config.base_path.join(IMAGES_DIR);
        std::fs::create_dir_all(&images).map_err(|e| StorageError::io(&images, e))?;
        if !config.base_path.is_dir() {
            return Err(StorageError::BadBasePath(
                config.base_path.display().to_string(),
            ));
        }
        info!(base = %config.base_path.display(), "storage sink ready");
        Ok(Self { config, cleanups: 0 })
    }

    /// Day partition directory for a capture timestamp.
    pub fn partition_for(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.config
            .base_path
            .join(IMAGES_DIR)
            .join(partition_name(timestamp.date_naive()))
    }

    /// Write one image.
    ///
    /// Ensures the partition exists, enforces the free-space floor (running
    /// one age-based cleanup pass and retrying once when below it), writes,
    /// and verifies a non-zero size on disk. A failure is reported to the
    /// caller as a dropped frame; there are no silent retries beyond the one
    /// cleanup-then-retry.
    pub fn save(
        &mut self,
        bytes: &[u8],
        timestamp: DateTime<Utc>,
        filename: &str,
    ) -> Result<PathBuf, StorageError> {
        if let Err(full) = self.check_free_space() {
            if self.config.days_to_keep == 0 {
                return Err(full);
            }
            self.cleanup_old_partitions(timestamp);
            self.check_free_space()?;
        }

        let partition = self.partition_for(timestamp);
        std::fs::create_dir_all(&partition).map_err(|e| StorageError::io(&partition, e))?;

        let path = partition.join(filename);
        std::fs::write(&path, bytes).map_err(|e| StorageError::io(&path, e))?;

        let written = std::fs::metadata(&path)
            .map_err(|e| StorageError::io(&path, e))?
            .len();
        if written == 0 {
            std::fs::remove_file(&path).ok();
            return Err(StorageError::EmptyWrite(path.display().to_string()));
        }

        debug!(path = %path.display(), len = written, "image written");
        Ok(path)
    }

    /// Free space on the storage mount in GB.
    pub fn free_space_gb(&self) -> Result<f64, StorageError> {
        free_bytes(&self.config.base_path).map(|b| b as f64 / 1e9)
    }

    /// Lightweight write-then-delete probe.
    ///
    /// `statvfs` succeeds against the mount *point* even after the drive
    /// underneath disappears, so health is proven by an actual write.
    pub fn is_healthy(&self) -> bool {
        let probe = self.config.base_path.join(PROBE_FILE);
        let ok = std::fs::write(&probe, b"probe").is_ok()
            && std::fs::remove_file(&probe).is_ok();
        if !ok {
            warn!(base = %self.config.base_path.display(), "storage probe failed");
        }
        ok
    }

    /// Cleanup passes run since startup.
    pub fn cleanups(&self) -> u64 {
        self.cleanups
    }

    fn check_free_space(&self) -> Result<(), StorageError> {
        let free_gb = self.free_space_gb()?;
        if free_gb < self.config.min_free_space_gb {
            return Err(StorageError::DiskFull {
                free_gb,
                min_gb: self.config.min_free_space_gb,
            });
        }
        Ok(())
    }

    /// Remove day partitions older than `days_to_keep`, oldest first.
    fn cleanup_old_partitions(&mut self, now: DateTime<Utc>) {
        self.cleanups += 1;
        let cutoff =
            partition_name((now - Duration::days(self.config.days_to_keep as i64)).date_naive());

        let images = self.config.base_path.join(IMAGES_DIR);
        let mut partitions = list_partitions(&images);
        partitions.sort();

        for name in partitions {
            // Partition names are YYYYMMDD, so the lexical comparison is a
            // date comparison.
            if name.as_str() >= cutoff.as_str() {
                break;
            }
            let dir = images.join(&name);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!(partition = %name, "removed old partition"),
                Err(e) => warn!(partition = %name, "partition cleanup failed: {}", e),
            }
        }
    }
}

/// Date-partition directory names (8 digits) under the image root.
fn list_partitions(images: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(images) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit()))
        .collect()
}

fn free_bytes(path: &Path) -> Result<u64, StorageError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StorageError::BadBasePath(path.display().to_string()))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if ret != 0 {
        return Err(StorageError::io(path, std::io::Error::last_os_error()));
    }
    Ok(vfs.f_bavail as u64 * vfs.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig {
            base_path: dir.to_path_buf(),
            min_free_space_gb: 0.0,
            days_to_keep: 30,
            filename_prefix: "rig".to_string(),
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 25, 13, 14, 15).unwrap()
    }

    #[test]
    fn test_save_creates_partition_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = StorageSink::new(config(dir.path())).unwrap();

        let path = sink
            .save(b"jpegbytes", ts(), "rig_20240425-131415-000_00001.jpg")
            .unwrap();
        assert!(path.ends_with("images/20240425/rig_20240425-131415-000_00001.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpegbytes");
    }

    #[test]
    fn test_empty_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = StorageSink::new(config(dir.path())).unwrap();

        let err = sink.save(b"", ts(), "empty.jpg").unwrap_err();
        assert!(matches!(err, StorageError::EmptyWrite(_)));
        assert!(!sink.partition_for(ts()).join("empty.jpg").exists());
    }

    #[test]
    fn test_free_space_and_health_probe() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StorageSink::new(config(dir.path())).unwrap();

        assert!(sink.free_space_gb().unwrap() > 0.0);
        assert!(sink.is_healthy());
    }

    #[test]
    fn test_unwritable_base_is_unhealthy() {
        let sink = StorageSink {
            config: StorageConfig {
                base_path: PathBuf::from("/nonexistent-rig-mount"),
                ..config(Path::new("/tmp"))
            },
            cleanups: 0,
        };
        assert!(!sink.is_healthy());
    }

    #[test]
    fn test_disk_full_refused_without_cleanup_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.min_free_space_gb = f64::MAX; // never satisfiable
        cfg.days_to_keep = 0;
        let mut sink = StorageSink::new(cfg).unwrap();

        let err = sink.save(b"data", ts(), "x.jpg").unwrap_err();
        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert_eq!(sink.cleanups(), 0);
    }

    #[test]
    fn test_low_space_triggers_cleanup_of_old_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(images.join("20240101")).unwrap();
        std::fs::create_dir_all(images.join("20240102")).unwrap();
        std::fs::create_dir_all(images.join("20240424")).unwrap();

        let mut cfg = config(dir.path());
        cfg.min_free_space_gb = f64::MAX;
        cfg.days_to_keep = 7;
        let mut sink = StorageSink::new(cfg).unwrap();

        // Still refuses (tempdir can never satisfy f64::MAX), but the
        // age-eligible partitions must be gone after the cleanup pass.
        assert!(sink.save(b"data", ts(), "x.jpg").is_err());
        assert_eq!(sink.cleanups(), 1);
        assert!(!images.join("20240101").exists());
        assert!(!images.join("20240102").exists());
        assert!(images.join("20240424").exists(), "recent partition kept");
    }

    #[test]
    fn test_partition_layout_contract() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StorageSink::new(config(dir.path())).unwrap();
        assert!(sink
            .partition_for(ts())
            .ends_with("images/20240425"));
    }
}
