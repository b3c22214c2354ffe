//! Image Storage Layer
//!
//! Date-partitioned image persistence on removable media:
//! - per-day sequence numbering and the on-disk filename contract
//! - free-space accounting with age-based cleanup
//! - a writability probe that catches silently unmounted USB drives

pub mod naming;
pub mod sink;

pub use naming::SequenceNamer;
pub use sink::{StorageConfig, StorageSink};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Free space below minimum ({free_gb:.2} GB < {min_gb:.2} GB)")]
    DiskFull { free_gb: f64, min_gb: f64 },

    #[error("Write verification failed for {0}: file is empty")]
    EmptyWrite(String),

    #[error("Storage base path is not a directory: {0}")]
    BadBasePath(String),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
