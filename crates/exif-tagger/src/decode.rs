//! EXIF APP1 decoding
//!
//! Reads back the tag set the rig writes. Used by the test suite and the
//! field diagnostic tooling to verify what actually landed on disk.

use crate::TagError;
use byteorder::{BigEndian, ByteOrder};

/// Decoded subset of the EXIF metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedExif {
    pub make: Option<String>,
    pub model: Option<String>,
    pub copyright: Option<String>,
    pub datetime_original: Option<String>,
    pub subsec_original: Option<String>,
    pub white_balance: Option<u16>,
    pub exposure_time: Option<f64>,
    pub iso: Option<u16>,
    pub latitude: Option<f64>,
    pub latitude_ref: Option<String>,
    pub longitude: Option<f64>,
    pub longitude_ref: Option<String>,
    pub altitude: Option<f64>,
    pub satellites: Option<String>,
    pub gps_datestamp: Option<String>,
}

struct RawEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    value: Vec<u8>,
}

/// Decode the EXIF APP1 segment of a JPEG.
pub fn decode(jpeg: &[u8]) -> Result<DecodedExif, TagError> {
    let tiff = find_exif_payload(jpeg)?;
    parse_tiff(tiff)
}

/// Walk JPEG segments until the Exif APP1 payload (TIFF body) is found.
fn find_exif_payload(jpeg: &[u8]) -> Result<&[u8], TagError> {
    if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return Err(TagError::NotJpeg("missing SOI marker".to_string()));
    }
    let mut pos = 2usize;
    loop {
        if pos + 4 > jpeg.len() {
            return Err(TagError::Malformed("no EXIF segment".to_string()));
        }
        if jpeg[pos] != 0xFF {
            return Err(TagError::Malformed(format!(
                "expected marker at {}, found {:#04x}",
                pos, jpeg[pos]
            )));
        }
        let marker = jpeg[pos + 1];
        // Standalone markers and entropy-coded data mean we are past the
        // metadata segments.
        if marker == 0xD9 || marker == 0xDA {
            return Err(TagError::Malformed("no EXIF segment".to_string()));
        }
        let len = BigEndian::read_u16(&jpeg[pos + 2..pos + 4]) as usize;
        if len < 2 || pos + 2 + len > jpeg.len() {
            return Err(TagError::Malformed("segment overruns file".to_string()));
        }
        let payload = &jpeg[pos + 4..pos + 2 + len];
        if marker == 0xE1 && payload.len() > 6 && &payload[..6] == b"Exif\0\0" {
            return Ok(&payload[6..]);
        }
        pos += 2 + len;
    }
}

fn parse_tiff(tiff: &[u8]) -> Result<DecodedExif, TagError> {
    if tiff.len() < 8 {
        return Err(TagError::Malformed("TIFF header truncated".to_string()));
    }
    if &tiff[..2] != b"MM" {
        return Err(TagError::Malformed(
            "only big-endian TIFF is supported".to_string(),
        ));
    }
    if BigEndian::read_u16(&tiff[2..4]) != 42 {
        return Err(TagError::Malformed("bad TIFF magic".to_string()));
    }
    let ifd0_offset = BigEndian::read_u32(&tiff[4..8]) as usize;

    let mut out = DecodedExif::default();
    let ifd0 = read_ifd(tiff, ifd0_offset)?;
    let mut exif_offset = None;
    let mut gps_offset = None;
    for e in &ifd0 {
        match e.tag {
            0x010F => out.make = e.as_ascii(),
            0x0110 => out.model = e.as_ascii(),
            0x8298 => out.copyright = e.as_ascii(),
            0x8769 => exif_offset = e.as_long(),
            0x8825 => gps_offset = e.as_long(),
            _ => {}
        }
    }

    if let Some(offset) = exif_offset {
        for e in &read_ifd(tiff, offset as usize)? {
            match e.tag {
                0x829A => {
                    out.exposure_time = e
                        .as_rationals()
                        .first()
                        .map(|&(n, d)| n as f64 / d.max(1) as f64);
                }
                0x8827 => out.iso = e.as_short(),
                0x9003 => out.datetime_original = e.as_ascii(),
                0x9291 => out.subsec_original = e.as_ascii(),
                0xA403 => out.white_balance = e.as_short(),
                _ => {}
            }
        }
    }

    if let Some(offset) = gps_offset {
        for e in &read_ifd(tiff, offset as usize)? {
            match e.tag {
                0x0001 => out.latitude_ref = e.as_ascii(),
                0x0002 => out.latitude = dms_to_degrees(&e.as_rationals()),
                0x0003 => out.longitude_ref = e.as_ascii(),
                0x0004 => out.longitude = dms_to_degrees(&e.as_rationals()),
                0x0006 => {
                    out.altitude = e
                        .as_rationals()
                        .first()
                        .map(|&(n, d)| n as f64 / d.max(1) as f64);
                }
                0x0008 => out.satellites = e.as_ascii(),
                0x001D => out.gps_datestamp = e.as_ascii(),
                _ => {}
            }
        }
    }

    Ok(out)
}

fn read_ifd(tiff: &[u8], offset: usize) -> Result<Vec<RawEntry>, TagError> {
    if offset + 2 > tiff.len() {
        return Err(TagError::Malformed("IFD offset out of range".to_string()));
    }
    let count = BigEndian::read_u16(&tiff[offset..offset + 2]) as usize;
    let entries_end = offset + 2 + count * 12;
    if entries_end + 4 > tiff.len() {
        return Err(TagError::Malformed("IFD truncated".to_string()));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + 2 + i * 12;
        let tag = BigEndian::read_u16(&tiff[at..at + 2]);
        let field_type = BigEndian::read_u16(&tiff[at + 2..at + 4]);
        let value_count = BigEndian::read_u32(&tiff[at + 4..at + 8]);
        let value_len = value_count as usize * type_size(field_type);
        let value = if value_len <= 4 {
            tiff[at + 8..at + 8 + value_len.min(4)].to_vec()
        } else {
            let data_offset = BigEndian::read_u32(&tiff[at + 8..at + 12]) as usize;
            if data_offset + value_len > tiff.len() {
                return Err(TagError::Malformed(format!(
                    "value for tag {:#06x} overruns TIFF body",
                    tag
                )));
            }
            tiff[data_offset..data_offset + value_len].to_vec()
        };
        entries.push(RawEntry {
            tag,
            field_type,
            count: value_count,
            value,
        });
    }
    Ok(entries)
}

fn type_size(field_type: u16) -> usize {
    match field_type {
        1 | 2 => 1, // BYTE, ASCII
        3 => 2,     // SHORT
        4 => 4,     // LONG
        5 => 8,     // RATIONAL
        _ => 1,
    }
}

fn dms_to_degrees(rationals: &[(u32, u32)]) -> Option<f64> {
    if rationals.len() != 3 {
        return None;
    }
    let value = |i: usize| rationals[i].0 as f64 / rationals[i].1.max(1) as f64;
    Some(value(0) + value(1) / 60.0 + value(2) / 3600.0)
}

impl RawEntry {
    fn as_ascii(&self) -> Option<String> {
        if self.field_type != 2 {
            return None;
        }
        let end = self
            .value
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.value.len());
        Some(String::from_utf8_lossy(&self.value[..end]).into_owned())
    }

    fn as_short(&self) -> Option<u16> {
        if self.field_type != 3 || self.value.len() < 2 {
            return None;
        }
        Some(BigEndian::read_u16(&self.value[..2]))
    }

    fn as_long(&self) -> Option<u32> {
        if self.field_type != 4 || self.value.len() < 4 {
            return None;
        }
        Some(BigEndian::read_u32(&self.value[..4]))
    }

    fn as_rationals(&self) -> Vec<(u32, u32)> {
        if self.field_type != 5 {
            return Vec::new();
        }
        (0..self.count as usize)
            .filter_map(|i| {
                let at = i * 8;
                if at + 8 > self.value.len() {
                    return None;
                }
                Some((
                    BigEndian::read_u32(&self.value[at..at + 4]),
                    BigEndian::read_u32(&self.value[at + 4..at + 8]),
                ))
            })
            .collect()
    }
}
