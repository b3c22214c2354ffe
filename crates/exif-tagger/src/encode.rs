//! EXIF APP1 segment construction
//!
//! Emits a big-endian TIFF structure with IFD0, an Exif sub-IFD and a GPS
//! sub-IFD. Only the fixed set of tags the rig writes is supported; the
//! layout is three IFD blocks laid out back-to-back after the TIFF header.

use crate::{CaptureMetadata, TagError};
use byteorder::{BigEndian, WriteBytesExt};
use gps_telemetry::GpsFix;

// IFD0
const TAG_MAKE: u16 = 0x010F;
const TAG_MODEL: u16 = 0x0110;
const TAG_DATETIME: u16 = 0x0132;
const TAG_COPYRIGHT: u16 = 0x8298;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

// Exif IFD
const TAG_EXPOSURE_TIME: u16 = 0x829A;
const TAG_ISO: u16 = 0x8827;
const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
const TAG_SUBSEC_ORIGINAL: u16 = 0x9291;
const TAG_WHITE_BALANCE: u16 = 0xA403;

// GPS IFD
const TAG_GPS_VERSION: u16 = 0x0000;
const TAG_GPS_LAT_REF: u16 = 0x0001;
const TAG_GPS_LAT: u16 = 0x0002;
const TAG_GPS_LON_REF: u16 = 0x0003;
const TAG_GPS_LON: u16 = 0x0004;
const TAG_GPS_ALT_REF: u16 = 0x0005;
const TAG_GPS_ALT: u16 = 0x0006;
const TAG_GPS_TIMESTAMP: u16 = 0x0007;
const TAG_GPS_SATELLITES: u16 = 0x0008;
const TAG_GPS_DATESTAMP: u16 = 0x001D;

const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

/// V4L2 absolute exposure is in units of 100 microseconds.
const EXPOSURE_UNIT_DENOMINATOR: u32 = 10_000;

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    value: Vec<u8>,
}

fn ascii(tag: u16, text: &str) -> Entry {
    let mut value = text.as_bytes().to_vec();
    value.push(0);
    Entry {
        tag,
        field_type: TYPE_ASCII,
        count: value.len() as u32,
        value,
    }
}

fn short(tag: u16, v: u16) -> Entry {
    Entry {
        tag,
        field_type: TYPE_SHORT,
        count: 1,
        value: v.to_be_bytes().to_vec(),
    }
}

fn long(tag: u16, v: u32) -> Entry {
    Entry {
        tag,
        field_type: TYPE_LONG,
        count: 1,
        value: v.to_be_bytes().to_vec(),
    }
}

fn bytes(tag: u16, data: &[u8]) -> Entry {
    Entry {
        tag,
        field_type: TYPE_BYTE,
        count: data.len() as u32,
        value: data.to_vec(),
    }
}

fn rationals(tag: u16, values: &[(u32, u32)]) -> Entry {
    let mut out = Vec::with_capacity(values.len() * 8);
    for &(num, den) in values {
        out.extend_from_slice(&num.to_be_bytes());
        out.extend_from_slice(&den.to_be_bytes());
    }
    Entry {
        tag,
        field_type: TYPE_RATIONAL,
        count: values.len() as u32,
        value: out,
    }
}

/// Decimal degrees to (deg, min, milli-seconds) rationals.
fn degrees_to_dms(value: f64) -> [(u32, u32); 3] {
    let abs = value.abs();
    let deg = abs.floor();
    let minutes_f = (abs - deg) * 60.0;
    let minutes = minutes_f.floor();
    let seconds_milli = ((minutes_f - minutes) * 60.0 * 1000.0).round() as u32;
    [
        (deg as u32, 1),
        (minutes as u32, 1),
        (seconds_milli, 1000),
    ]
}

fn ifd_size(entries: &[Entry]) -> u32 {
    let mut data_len = 0u32;
    for e in entries {
        if e.value.len() > 4 {
            if data_len % 2 == 1 {
                data_len += 1;
            }
            data_len += e.value.len() as u32;
        }
    }
    2 + entries.len() as u32 * 12 + 4 + data_len
}

/// Serialize one IFD at a known offset within the TIFF body. Entries must
/// already be in ascending tag order and must not be reordered after
/// [`ifd_size`] was taken, or the data-area padding would shift.
fn serialize_ifd(entries: Vec<Entry>, ifd_offset: u32) -> Vec<u8> {
    let data_start = ifd_offset + 2 + entries.len() as u32 * 12 + 4;
    let mut out = Vec::new();
    let mut data: Vec<u8> = Vec::new();

    out.write_u16::<BigEndian>(entries.len() as u16).unwrap();
    for e in &entries {
        out.write_u16::<BigEndian>(e.tag).unwrap();
        out.write_u16::<BigEndian>(e.field_type).unwrap();
        out.write_u32::<BigEndian>(e.count).unwrap();
        if e.value.len() <= 4 {
            let mut inline = e.value.clone();
            inline.resize(4, 0);
            out.extend_from_slice(&inline);
        } else {
            if data.len() % 2 == 1 {
                data.push(0);
            }
            out.write_u32::<BigEndian>(data_start + data.len() as u32)
                .unwrap();
            data.extend_from_slice(&e.value);
        }
    }
    out.write_u32::<BigEndian>(0).unwrap(); // no next IFD
    out.extend_from_slice(&data);
    out
}

fn ifd0_entries(meta: &CaptureMetadata) -> Vec<Entry> {
    vec![
        ascii(TAG_MAKE, &meta.camera.make),
        ascii(TAG_MODEL, &meta.camera.model),
        ascii(
            TAG_DATETIME,
            &meta.timestamp_utc.format("%Y:%m:%d %H:%M:%S").to_string(),
        ),
        ascii(TAG_COPYRIGHT, &meta.camera.copyright),
    ]
}

fn exif_entries(meta: &CaptureMetadata) -> Vec<Entry> {
    let mut entries = vec![
        ascii(
            TAG_DATETIME_ORIGINAL,
            &meta.timestamp_utc.format("%Y:%m:%d %H:%M:%S").to_string(),
        ),
        ascii(
            TAG_SUBSEC_ORIGINAL,
            &format!("{:03}", meta.timestamp_utc.timestamp_subsec_millis()),
        ),
        short(
            TAG_WHITE_BALANCE,
            u16::from(meta.camera.white_balance != "auto"),
        ),
    ];
    if let Some(exposure) = meta
        .camera
        .exposure
        .as_deref()
        .and_then(|e| e.parse::<u32>().ok())
    {
        entries.push(rationals(
            TAG_EXPOSURE_TIME,
            &[(exposure, EXPOSURE_UNIT_DENOMINATOR)],
        ));
    }
    if let Some(iso) = meta
        .camera
        .gain
        .as_deref()
        .and_then(|g| g.parse::<u16>().ok())
    {
        entries.push(short(TAG_ISO, iso));
    }
    entries
}

fn gps_entries(meta: &CaptureMetadata) -> Vec<Entry> {
    let mut entries = vec![bytes(TAG_GPS_VERSION, &[2, 3, 0, 0])];

    match &meta.gps {
        Some(fix) => {
            entries.push(ascii(
                TAG_GPS_LAT_REF,
                if fix.latitude >= 0.0 { "N" } else { "S" },
            ));
            entries.push(rationals(TAG_GPS_LAT, &degrees_to_dms(fix.latitude)));
            entries.push(ascii(
                TAG_GPS_LON_REF,
                if fix.longitude >= 0.0 { "E" } else { "W" },
            ));
            entries.push(rationals(TAG_GPS_LON, &degrees_to_dms(fix.longitude)));
            entries.push(ascii(
                TAG_GPS_SATELLITES,
                &fix.satellites_used.to_string(),
            ));
            if let Some(alt) = fix.altitude {
                entries.push(bytes(TAG_GPS_ALT_REF, &[u8::from(alt < 0.0)]));
                entries.push(rationals(
                    TAG_GPS_ALT,
                    &[((alt.abs() * 1000.0).round() as u32, 1000)],
                ));
            }
            push_gps_time(&mut entries, fix);
        }
        None => {
            // Explicit fallback: 0°N, 0°W, zero satellites. Never omit the
            // GPS block entirely.
            entries.push(ascii(TAG_GPS_LAT_REF, "N"));
            entries.push(rationals(TAG_GPS_LAT, &[(0, 1), (0, 1), (0, 1000)]));
            entries.push(ascii(TAG_GPS_LON_REF, "W"));
            entries.push(rationals(TAG_GPS_LON, &[(0, 1), (0, 1), (0, 1000)]));
            entries.push(ascii(TAG_GPS_SATELLITES, "0"));
            entries.push(ascii(
                TAG_GPS_DATESTAMP,
                &meta.timestamp_utc.format("%Y:%m:%d").to_string(),
            ));
        }
    }
    entries
}

fn push_gps_time(entries: &mut Vec<Entry>, fix: &GpsFix) {
    use chrono::Timelike;

    let t = fix.timestamp_utc;
    let second_milli = t.second() * 1000 + t.timestamp_subsec_millis();
    entries.push(rationals(
        TAG_GPS_TIMESTAMP,
        &[(t.hour(), 1), (t.minute(), 1), (second_milli, 1000)],
    ));
    entries.push(ascii(
        TAG_GPS_DATESTAMP,
        &t.format("%Y:%m:%d").to_string(),
    ));
}

/// Build the complete APP1 segment (marker, length, Exif header, TIFF).
pub fn build_app1(meta: &CaptureMetadata) -> Result<Vec<u8>, TagError> {
    let mut exif = exif_entries(meta);
    let mut gps = gps_entries(meta);

    let mut ifd0 = ifd0_entries(meta);
    // Pointer values are patched below; their size is fixed either way.
    ifd0.push(long(TAG_EXIF_IFD, 0));
    ifd0.push(long(TAG_GPS_IFD, 0));

    ifd0.sort_by_key(|e| e.tag);
    exif.sort_by_key(|e| e.tag);
    gps.sort_by_key(|e| e.tag);

    let ifd0_offset = 8u32;
    let exif_offset = ifd0_offset + ifd_size(&ifd0);
    let gps_offset = exif_offset + ifd_size(&exif);

    for e in ifd0.iter_mut() {
        if e.tag == TAG_EXIF_IFD {
            e.value = exif_offset.to_be_bytes().to_vec();
        } else if e.tag == TAG_GPS_IFD {
            e.value = gps_offset.to_be_bytes().to_vec();
        }
    }

    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM");
    tiff.write_u16::<BigEndian>(42).unwrap();
    tiff.write_u32::<BigEndian>(ifd0_offset).unwrap();
    tiff.extend_from_slice(&serialize_ifd(ifd0, ifd0_offset));
    tiff.extend_from_slice(&serialize_ifd(exif, exif_offset));
    tiff.extend_from_slice(&serialize_ifd(gps, gps_offset));

    let payload_len = 6 + tiff.len(); // "Exif\0\0" + TIFF
    let segment_len = payload_len + 2;
    if segment_len > u16::MAX as usize {
        return Err(TagError::SegmentTooLarge(segment_len));
    }

    let mut app1 = Vec::with_capacity(4 + payload_len);
    app1.extend_from_slice(&[0xFF, 0xE1]);
    app1.write_u16::<BigEndian>(segment_len as u16).unwrap();
    app1.extend_from_slice(b"Exif\0\0");
    app1.extend_from_slice(&tiff);
    Ok(app1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrees_to_dms_roundtrip() {
        let [d, m, s] = degrees_to_dms(45.5125);
        let back = d.0 as f64 / d.1 as f64
            + (m.0 as f64 / m.1 as f64) / 60.0
            + (s.0 as f64 / s.1 as f64) / 3600.0;
        assert!((back - 45.5125).abs() < 1e-6);
    }

    #[test]
    fn test_ifd_size_matches_serialized_length() {
        let entries = vec![
            ascii(TAG_MAKE, "OceanCam"),
            short(TAG_WHITE_BALANCE, 0),
            rationals(TAG_GPS_LAT, &[(1, 1), (2, 1), (3, 1000)]),
        ];
        let size = ifd_size(&entries);
        let serialized = serialize_ifd(entries, 8);
        assert_eq!(size as usize, serialized.len());
    }
}
