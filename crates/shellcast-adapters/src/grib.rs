//! Minimal GRIB2 section walker.
//!
//! Only the pieces needed to pick threshold bands out of probabilistic
//! precipitation products are decoded: the field ordinal of every product
//! definition section and, for probability templates 4.5 and 4.9, the upper
//! limit of the probability interval.

use thiserror::Error;

const INDICATOR_LEN: usize = 16;
const END_MARKER: &[u8; 4] = b"7777";

/// Product templates 4.5 and 4.9 share the probability block layout.
const PROBABILITY_TEMPLATES: [u16; 2] = [5, 9];
/// 0-based offsets inside section 4 (octets 43 and 44-47).
const UPPER_SCALE_FACTOR_AT: usize = 42;
const UPPER_SCALED_VALUE_AT: usize = 43;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GribError {
    #[error("message at byte {offset} does not start with GRIB")]
    NotGrib { offset: usize },
    #[error("unsupported GRIB edition {edition}")]
    UnsupportedEdition { edition: u8 },
    #[error("truncated GRIB message at byte {offset}")]
    Truncated { offset: usize },
    #[error("GRIB section at byte {offset} has invalid length {length}")]
    BadSection { offset: usize, length: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BandInfo {
    /// 1-based ordinal of the field across the whole file.
    pub index: usize,
    pub template: u16,
    /// Upper probability limit in millimetres, when the template carries one
    /// and it is not flagged missing.
    pub upper_limit_mm: Option<f64>,
}

/// Walk every message in `bytes` and describe each product definition.
pub fn scan_bands(bytes: &[u8]) -> Result<Vec<BandInfo>, GribError> {
    let mut bands = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        // Trailing padding after the last message is tolerated.
        if bytes[offset..].iter().all(|b| *b == 0) {
            break;
        }
        let message_len = read_indicator(bytes, offset)?;
        let message_end = offset
            .checked_add(message_len)
            .filter(|end| *end <= bytes.len())
            .ok_or(GribError::Truncated { offset })?;

        let mut cursor = offset + INDICATOR_LEN;
        while cursor < message_end {
            if bytes.get(cursor..cursor + 4) == Some(END_MARKER.as_slice()) {
                break;
            }
            let header = bytes
                .get(cursor..cursor + 5)
                .ok_or(GribError::Truncated { offset: cursor })?;
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let number = header[4];
            let section_end = cursor
                .checked_add(length as usize)
                .filter(|end| length >= 5 && *end <= message_end)
                .ok_or(GribError::BadSection { offset: cursor, length })?;

            if number == 4 {
                let section = &bytes[cursor..section_end];
                bands.push(describe_product(section, bands.len() + 1));
            }
            cursor = section_end;
        }
        offset = message_end;
    }

    Ok(bands)
}

fn read_indicator(bytes: &[u8], offset: usize) -> Result<usize, GribError> {
    let section = bytes
        .get(offset..offset + INDICATOR_LEN)
        .ok_or(GribError::Truncated { offset })?;
    if &section[..4] != b"GRIB" {
        return Err(GribError::NotGrib { offset });
    }
    if section[7] != 2 {
        return Err(GribError::UnsupportedEdition {
            edition: section[7],
        });
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&section[8..16]);
    usize::try_from(u64::from_be_bytes(len)).map_err(|_| GribError::Truncated { offset })
}

fn describe_product(section: &[u8], index: usize) -> BandInfo {
    let template = section
        .get(7..9)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .unwrap_or(u16::MAX);

    let upper_limit_mm = if PROBABILITY_TEMPLATES.contains(&template) {
        upper_limit(section)
    } else {
        None
    };

    BandInfo {
        index,
        template,
        upper_limit_mm,
    }
}

fn upper_limit(section: &[u8]) -> Option<f64> {
    let scale_raw = *section.get(UPPER_SCALE_FACTOR_AT)?;
    let value_raw = section.get(UPPER_SCALED_VALUE_AT..UPPER_SCALED_VALUE_AT + 4)?;
    if scale_raw == 0xFF && value_raw.iter().all(|b| *b == 0xFF) {
        return None;
    }
    let scale = sign_magnitude_i8(scale_raw);
    let value = sign_magnitude_i32([value_raw[0], value_raw[1], value_raw[2], value_raw[3]]);
    Some(f64::from(value) * 10f64.powi(-i32::from(scale)))
}

/// GRIB2 encodes negative integers with a sign bit, not two's complement.
fn sign_magnitude_i8(raw: u8) -> i8 {
    let magnitude = (raw & 0x7F) as i8;
    if raw & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn sign_magnitude_i32(raw: [u8; 4]) -> i32 {
    let bits = u32::from_be_bytes(raw);
    let magnitude = (bits & 0x7FFF_FFFF) as i32;
    if bits & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Synthetic messages for tests elsewhere in the workspace.
pub mod testing {
    /// One GRIB2 message with a probability product section per entry of
    /// `upper_limits`, each given as `(scale_factor, scaled_value)`.
    /// `None` writes the missing-value pattern.
    pub fn probability_message(template: u16, upper_limits: &[Option<(i8, i32)>]) -> Vec<u8> {
        let mut body = Vec::new();
        // Section 1 with an arbitrary 21-byte identification block.
        push_section(&mut body, 1, &[0u8; 16]);
        for limit in upper_limits {
            let mut pds = vec![0u8; 58 - 5];
            // Octets 6-7: number of coordinate values; 8-9: template number.
            pds[2..4].copy_from_slice(&template.to_be_bytes());
            match limit {
                Some((scale, value)) => {
                    pds[42 - 5] = encode_i8(*scale);
                    pds[43 - 5..47 - 5].copy_from_slice(&encode_i32(*value));
                }
                None => {
                    pds[42 - 5..47 - 5].copy_from_slice(&[0xFF; 5]);
                }
            }
            push_section(&mut body, 4, &pds);
        }

        let total = 16 + body.len() + 4;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(b"GRIB");
        out.extend_from_slice(&[0, 0, 0, 2]);
        out.extend_from_slice(&(total as u64).to_be_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(b"7777");
        out
    }

    fn push_section(out: &mut Vec<u8>, number: u8, payload: &[u8]) {
        let len = (payload.len() + 5) as u32;
        out.extend_from_slice(&len.to_be_bytes());
        out.push(number);
        out.extend_from_slice(payload);
    }

    fn encode_i8(value: i8) -> u8 {
        if value < 0 {
            0x80 | value.unsigned_abs()
        } else {
            value as u8
        }
    }

    fn encode_i32(value: i32) -> [u8; 4] {
        let bits = if value < 0 {
            0x8000_0000 | value.unsigned_abs()
        } else {
            value as u32
        };
        bits.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::probability_message;
    use super::*;

    #[test]
    fn reads_upper_limits_in_field_order() {
        // 25.4 mm, 50.8 mm, missing.
        let bytes = probability_message(9, &[Some((1, 254)), Some((1, 508)), None]);
        let bands = scan_bands(&bytes).expect("scan");
        assert_eq!(bands.len(), 3);
        assert_eq!(bands[0].index, 1);
        assert!((bands[0].upper_limit_mm.expect("limit") - 25.4).abs() < 1e-9);
        assert!((bands[1].upper_limit_mm.expect("limit") - 50.8).abs() < 1e-9);
        assert_eq!(bands[2].upper_limit_mm, None);
    }

    #[test]
    fn negative_scale_factors_multiply() {
        let bytes = probability_message(5, &[Some((-1, 3))]);
        let bands = scan_bands(&bytes).expect("scan");
        assert!((bands[0].upper_limit_mm.expect("limit") - 30.0).abs() < 1e-9);
    }

    #[test]
    fn non_probability_templates_have_no_limit() {
        let bytes = probability_message(0, &[Some((1, 254))]);
        let bands = scan_bands(&bytes).expect("scan");
        assert_eq!(bands[0].upper_limit_mm, None);
    }

    #[test]
    fn band_ordinals_continue_across_messages() {
        let mut bytes = probability_message(9, &[Some((1, 254))]);
        bytes.extend(probability_message(9, &[Some((1, 508)), Some((1, 762))]));
        let bands = scan_bands(&bytes).expect("scan");
        let indices: Vec<_> = bands.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_other_formats() {
        assert_eq!(
            scan_bands(b"II*\0 not a grib file"),
            Err(GribError::NotGrib { offset: 0 })
        );
        let mut edition_one = probability_message(9, &[]);
        edition_one[7] = 1;
        assert_eq!(
            scan_bands(&edition_one),
            Err(GribError::UnsupportedEdition { edition: 1 })
        );
        let full = probability_message(9, &[Some((1, 254))]);
        assert!(matches!(
            scan_bands(&full[..full.len() - 10]),
            Err(GribError::Truncated { .. })
        ));
    }
}
