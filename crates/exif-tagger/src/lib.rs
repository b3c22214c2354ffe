//! EXIF Tagging
//!
//! Builds the EXIF APP1 segment for each captured frame and splices it into
//! the JPEG. The GPS block is always present: a real fix when one is valid,
//! otherwise the recognizable 0°N/0°W zero-satellite fallback, so downstream
//! consumers can always distinguish "no fix" from "never tagged".

pub mod decode;
mod encode;

pub use decode::DecodedExif;

use camera_capture::CameraParams;
use chrono::{DateTime, Utc};
use gps_telemetry::GpsFix;
use thiserror::Error;

/// Tagging error types
#[derive(Debug, Error)]
pub enum TagError {
    #[error("Not a JPEG: {0}")]
    NotJpeg(String),

    #[error("EXIF segment too large: {0} bytes")]
    SegmentTooLarge(usize),

    #[error("Malformed EXIF data: {0}")]
    Malformed(String),
}

/// Everything the tagger needs for one frame.
#[derive(Debug, Clone)]
pub struct CaptureMetadata {
    pub timestamp_utc: DateTime<Utc>,
    /// Valid fix, or `None` for the fallback tag.
    pub gps: Option<GpsFix>,
    pub camera: CameraParams,
}

/// Frame tagging collaborator consumed by the capture loop.
pub trait ImageTagger: Send + Sync {
    /// Return the JPEG with embedded metadata.
    fn tag(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<Vec<u8>, TagError>;
}

/// EXIF APP1 tagger.
pub struct ExifTagger;

impl ExifTagger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExifTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTagger for ExifTagger {
    fn tag(&self, jpeg: &[u8], meta: &CaptureMetadata) -> Result<Vec<u8>, TagError> {
        if jpeg.len() < 2 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
            return Err(TagError::NotJpeg("missing SOI marker".to_string()));
        }

        let app1 = encode::build_app1(meta)?;
        let mut out = Vec::with_capacity(jpeg.len() + app1.len());
        out.extend_from_slice(&jpeg[..2]);
        out.extend_from_slice(&app1);
        out.extend_from_slice(&jpeg[2..]);
        Ok(out)
    }
}

/// Pass-through tagger for tests that only exercise the pipeline shape.
pub struct NoopTagger;

impl ImageTagger for NoopTagger {
    fn tag(&self, jpeg: &[u8], _meta: &CaptureMetadata) -> Result<Vec<u8>, TagError> {
        Ok(jpeg.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params() -> CameraParams {
        CameraParams {
            make: "OceanCam".to_string(),
            model: "OC-1000".to_string(),
            copyright: "Seabed Survey Project".to_string(),
            exposure: Some("156".to_string()),
            gain: Some("100".to_string()),
            white_balance: "auto".to_string(),
        }
    }

    fn meta(gps: Option<GpsFix>) -> CaptureMetadata {
        CaptureMetadata {
            timestamp_utc: Utc.with_ymd_and_hms(2024, 4, 25, 13, 14, 15).unwrap()
                + chrono::Duration::milliseconds(250),
            gps,
            camera: params(),
        }
    }

    fn valid_fix() -> GpsFix {
        GpsFix {
            latitude: 45.5,
            longitude: -122.25,
            altitude: Some(12.5),
            fix_quality: 1,
            satellites_used: 7,
            hdop: Some(1.1),
            timestamp_utc: Utc.with_ymd_and_hms(2024, 4, 25, 13, 14, 14).unwrap(),
        }
    }

    // A 2x2 grey JPEG is overkill to generate here; the tagger only needs
    // SOI + payload.
    fn tiny_jpeg() -> Vec<u8> {
        vec![0xFF, 0xD8, 0xFF, 0xD9]
    }

    #[test]
    fn test_rejects_non_jpeg() {
        let tagger = ExifTagger::new();
        assert!(tagger.tag(b"PNG...", &meta(None)).is_err());
    }

    #[test]
    fn test_roundtrip_with_valid_fix() {
        let tagger = ExifTagger::new();
        let tagged = tagger.tag(&tiny_jpeg(), &meta(Some(valid_fix()))).unwrap();

        let exif = decode::decode(&tagged).unwrap();
        assert_eq!(exif.make.as_deref(), Some("OceanCam"));
        assert_eq!(exif.model.as_deref(), Some("OC-1000"));
        assert_eq!(exif.copyright.as_deref(), Some("Seabed Survey Project"));
        assert_eq!(
            exif.datetime_original.as_deref(),
            Some("2024:04:25 13:14:15")
        );
        assert_eq!(exif.subsec_original.as_deref(), Some("250"));

        assert_eq!(exif.latitude_ref.as_deref(), Some("N"));
        assert_eq!(exif.longitude_ref.as_deref(), Some("W"));
        let lat = exif.latitude.unwrap();
        let lon = exif.longitude.unwrap();
        assert!((lat - 45.5).abs() < 1e-4, "lat {}", lat);
        assert!((lon - 122.25).abs() < 1e-4, "lon {}", lon);
        assert_eq!(exif.satellites.as_deref(), Some("7"));
        assert!((exif.altitude.unwrap() - 12.5).abs() < 1e-3);
        assert_eq!(exif.gps_datestamp.as_deref(), Some("2024:04:25"));
    }

    #[test]
    fn test_fallback_tag_when_no_fix() {
        let tagger = ExifTagger::new();
        let tagged = tagger.tag(&tiny_jpeg(), &meta(None)).unwrap();

        let exif = decode::decode(&tagged).unwrap();
        // 0°N, 0°W with zero satellites: distinguishable from a real fix at
        // the equator/prime-meridian only by the satellites field.
        assert_eq!(exif.latitude, Some(0.0));
        assert_eq!(exif.longitude, Some(0.0));
        assert_eq!(exif.latitude_ref.as_deref(), Some("N"));
        assert_eq!(exif.longitude_ref.as_deref(), Some("W"));
        assert_eq!(exif.satellites.as_deref(), Some("0"));
    }

    #[test]
    fn test_southern_western_refs() {
        let fix = GpsFix {
            latitude: -33.8568,
            longitude: 151.2153,
            ..valid_fix()
        };
        let tagger = ExifTagger::new();
        let tagged = tagger.tag(&tiny_jpeg(), &meta(Some(fix))).unwrap();

        let exif = decode::decode(&tagged).unwrap();
        assert_eq!(exif.latitude_ref.as_deref(), Some("S"));
        assert_eq!(exif.longitude_ref.as_deref(), Some("E"));
        assert!((exif.latitude.unwrap() - 33.8568).abs() < 1e-4);
        assert!((exif.longitude.unwrap() - 151.2153).abs() < 1e-4);
    }

    #[test]
    fn test_tagged_jpeg_still_decodes() {
        use camera_capture::backend::{CameraBackend, SimulatedBackend};

        let mut backend = SimulatedBackend::new();
        backend.open(&camera_capture::CameraConfig::default()).unwrap();
        let frame = backend.grab().unwrap();

        let tagger = ExifTagger::new();
        let tagged = tagger.tag(&frame.bytes, &meta(Some(valid_fix()))).unwrap();
        assert!(image::load_from_memory(&tagged).is_ok());
    }

    #[test]
    fn test_white_balance_and_exposure_fields() {
        let tagger = ExifTagger::new();
        let tagged = tagger.tag(&tiny_jpeg(), &meta(None)).unwrap();
        let exif = decode::decode(&tagged).unwrap();

        assert_eq!(exif.white_balance, Some(0)); // auto
        let exposure = exif.exposure_time.unwrap();
        // 156 units of 100us
        assert!((exposure - 0.0156).abs() < 1e-6, "exposure {}", exposure);
    }
}
