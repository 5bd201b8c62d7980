//! On-the-fly value conversion between a segment's creation schema and
//! the table schema a reader passes in.
//!
//! Conversions are total where possible; a var→numeric parse failure
//! reports the row as null for that read rather than failing the scan.

use byteorder::{ByteOrder, LittleEndian};

use crate::data::ColumnType;

/// Decode a fixed cell as a signed integer. Timestamp cells decode to
/// their microsecond value.
pub fn decode_i64(cell: &[u8], ty: ColumnType) -> i64 {
    match ty {
        ColumnType::Bool | ColumnType::Int8 => cell[0] as i8 as i64,
        ColumnType::Int16 => LittleEndian::read_i16(cell) as i64,
        ColumnType::Int32 => LittleEndian::read_i32(cell) as i64,
        ColumnType::Int64 | ColumnType::Timestamp | ColumnType::TimestampLsn => {
            LittleEndian::read_i64(cell)
        }
        ColumnType::Float32 => LittleEndian::read_f32(cell) as i64,
        ColumnType::Float64 => LittleEndian::read_f64(cell) as i64,
        _ => 0,
    }
}

pub fn decode_f64(cell: &[u8], ty: ColumnType) -> f64 {
    match ty {
        ColumnType::Float32 => LittleEndian::read_f32(cell) as f64,
        ColumnType::Float64 => LittleEndian::read_f64(cell),
        other => decode_i64(cell, other) as f64,
    }
}

/// Encode an integer into a cell of the given type, truncating to the
/// destination width.
pub fn encode_i64(v: i64, ty: ColumnType) -> Vec<u8> {
    match ty {
        ColumnType::Bool => vec![(v != 0) as u8],
        ColumnType::Int8 => vec![v as i8 as u8],
        ColumnType::Int16 => (v as i16).to_le_bytes().to_vec(),
        ColumnType::Int32 => (v as i32).to_le_bytes().to_vec(),
        ColumnType::Int64 | ColumnType::Timestamp => v.to_le_bytes().to_vec(),
        ColumnType::Float32 => (v as f32).to_le_bytes().to_vec(),
        ColumnType::Float64 => (v as f64).to_le_bytes().to_vec(),
        _ => vec![0; ty.fixed_len()],
    }
}

pub fn encode_f64(v: f64, ty: ColumnType) -> Vec<u8> {
    match ty {
        ColumnType::Float32 => (v as f32).to_le_bytes().to_vec(),
        ColumnType::Float64 => v.to_le_bytes().to_vec(),
        other => encode_i64(v as i64, other),
    }
}

/// Convert one fixed-width cell to another fixed type. Returns None
/// when the combination is undefined (the row reads as null).
pub fn convert_fixed(src: &[u8], from: ColumnType, to: ColumnType) -> Option<Vec<u8>> {
    if from == to {
        return Some(src.to_vec());
    }
    match (from, to) {
        // integer and bool widths: sign-extend or truncate
        (f, t) if (f.is_signed_int() || f == ColumnType::Bool) && t.is_signed_int() => {
            Some(encode_i64(decode_i64(src, f), t))
        }
        (f, t) if f.is_signed_int() && t.is_float() => Some(encode_f64(decode_i64(src, f) as f64, t)),
        (f, t) if f.is_float() && t.is_float() => Some(encode_f64(decode_f64(src, f), t)),
        (f, t) if f.is_float() && t.is_signed_int() => Some(encode_i64(decode_f64(src, f) as i64, t)),
        (f, t) if f.is_timestamp() && t.is_signed_int() => Some(encode_i64(decode_i64(src, f), t)),
        // char/binary resize: pad with zero bytes or truncate
        (ColumnType::Char(_) | ColumnType::Binary(_), ColumnType::Char(n) | ColumnType::Binary(n)) => {
            let mut out = src.to_vec();
            out.resize(n as usize, 0);
            Some(out)
        }
        _ => None,
    }
}

/// Parse a var-length value with the destination column's numeric
/// grammar. Invalid input means the row is null for this read.
pub fn parse_var_to_fixed(bytes: &[u8], to: ColumnType) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    match to {
        ColumnType::Bool => match text {
            "true" | "TRUE" | "1" => Some(vec![1]),
            "false" | "FALSE" | "0" => Some(vec![0]),
            _ => None,
        },
        t if t.is_signed_int() || t.is_timestamp() => {
            let v: i64 = text.parse().ok()?;
            match t {
                ColumnType::Int8 => i8::try_from(v).ok().map(|x| vec![x as u8]),
                ColumnType::Int16 => i16::try_from(v).ok().map(|x| x.to_le_bytes().to_vec()),
                ColumnType::Int32 => i32::try_from(v).ok().map(|x| x.to_le_bytes().to_vec()),
                _ => Some(v.to_le_bytes().to_vec()),
            }
        }
        t if t.is_float() => {
            let v: f64 = text.parse().ok()?;
            Some(encode_f64(v, t))
        }
        ColumnType::Char(n) | ColumnType::Binary(n) => {
            if bytes.len() > n as usize {
                return None;
            }
            let mut out = bytes.to_vec();
            out.resize(n as usize, 0);
            Some(out)
        }
        _ => None,
    }
}

/// Format a fixed cell in the column's canonical textual form, for
/// fixed → varstring reads.
pub fn format_fixed_to_var(src: &[u8], from: ColumnType) -> Option<Vec<u8>> {
    let text = match from {
        ColumnType::Bool => {
            if src[0] != 0 {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        f if f.is_signed_int() || f.is_timestamp() => decode_i64(src, f).to_string(),
        ColumnType::Float32 => LittleEndian::read_f32(src).to_string(),
        ColumnType::Float64 => LittleEndian::read_f64(src).to_string(),
        ColumnType::Char(_) | ColumnType::Binary(_) => {
            // strip zero padding
            let end = src.iter().rposition(|&b| b != 0).map(|p| p + 1).unwrap_or(0);
            return Some(src[..end].to_vec());
        }
        _ => return None,
    };
    Some(text.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_widen_and_truncate() {
        let v = (-5i16).to_le_bytes();
        let out = convert_fixed(&v, ColumnType::Int16, ColumnType::Int64).unwrap();
        assert_eq!(LittleEndian::read_i64(&out), -5);

        let v = 0x1_0002i32.to_le_bytes();
        let out = convert_fixed(&v, ColumnType::Int32, ColumnType::Int16).unwrap();
        assert_eq!(LittleEndian::read_i16(&out), 2);
    }

    #[test]
    fn test_int_float_cross() {
        let v = 7i32.to_le_bytes();
        let out = convert_fixed(&v, ColumnType::Int32, ColumnType::Float64).unwrap();
        assert_eq!(LittleEndian::read_f64(&out), 7.0);

        let v = 2.9f64.to_le_bytes();
        let out = convert_fixed(&v, ColumnType::Float64, ColumnType::Int32).unwrap();
        assert_eq!(LittleEndian::read_i32(&out), 2);
    }

    #[test]
    fn test_var_parse() {
        assert_eq!(
            parse_var_to_fixed(b"42", ColumnType::Int32).unwrap(),
            42i32.to_le_bytes()
        );
        assert_eq!(
            parse_var_to_fixed(b" 2.5 ", ColumnType::Float64).unwrap(),
            2.5f64.to_le_bytes()
        );
        // invalid input reads as null
        assert!(parse_var_to_fixed(b"not-a-number", ColumnType::Int32).is_none());
        // out-of-range narrows to null, not wraparound
        assert!(parse_var_to_fixed(b"300", ColumnType::Int8).is_none());
    }

    #[test]
    fn test_format_to_var() {
        assert_eq!(
            format_fixed_to_var(&5i32.to_le_bytes(), ColumnType::Int32).unwrap(),
            b"5"
        );
        assert_eq!(
            format_fixed_to_var(&[1], ColumnType::Bool).unwrap(),
            b"true"
        );
        let mut padded = b"ab".to_vec();
        padded.resize(8, 0);
        assert_eq!(
            format_fixed_to_var(&padded, ColumnType::Char(8)).unwrap(),
            b"ab"
        );
    }

    #[test]
    fn test_char_resize() {
        let mut cell = b"xy".to_vec();
        cell.resize(4, 0);
        let out = convert_fixed(&cell, ColumnType::Char(4), ColumnType::Char(8)).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(&out[..2], b"xy");
    }
}
