//! Record format: a varint header length (counting itself), one varint
//! serial type per field, then the field bodies in order.

pub mod key;
pub mod value;

pub use key::{Collation, CompareFlags, KeyField, KeyInfo, SortOrder};
pub use value::Value;

use crate::buffer::varint::{put_varint, try_get_varint, varint_len};
use crate::buffer::Pointer;
use crate::error::{Error, Result};
use crate::pager::header::TextEncoding;

const SERIAL_NULL: u64 = 0;
const SERIAL_FLOAT: u64 = 7;
const SERIAL_ZERO: u64 = 8;
const SERIAL_ONE: u64 = 9;

/// Byte widths of serial types 1 through 6.
const INT_WIDTHS: [usize; 6] = [1, 2, 3, 4, 6, 8];

/// Serial type of `value` and the length of its body.
pub fn serial_type(value: &Value, encoding: TextEncoding) -> (u64, usize) {
    match value {
        Value::Null => (SERIAL_NULL, 0),
        Value::Integer(0) => (SERIAL_ZERO, 0),
        Value::Integer(1) => (SERIAL_ONE, 0),
        Value::Integer(i) => {
            let width = int_width(*i);
            let serial = INT_WIDTHS.iter().position(|w| *w == width).map_or(6, |p| p + 1);
            (serial as u64, width)
        }
        Value::Real(r) if r.is_nan() => (SERIAL_NULL, 0),
        Value::Real(_) => (SERIAL_FLOAT, 8),
        Value::Text(s) => {
            let len = text_len(s, encoding);
            (13 + 2 * len as u64, len)
        }
        Value::Blob(b) => (12 + 2 * b.len() as u64, b.len()),
    }
}

fn int_width(i: i64) -> usize {
    INT_WIDTHS
        .iter()
        .copied()
        .find(|w| {
            let bits = (w * 8) as u32;
            bits == 64 || (-(1i64 << (bits - 1))..(1i64 << (bits - 1))).contains(&i)
        })
        .unwrap_or(8)
}

/// Body length of a serial type.
pub fn serial_type_len(serial: u64) -> Result<usize> {
    match serial {
        0 | 8 | 9 => Ok(0),
        1..=6 => Ok(INT_WIDTHS[serial as usize - 1]),
        7 => Ok(8),
        10 | 11 => Err(Error::corrupt(format!("reserved serial type {serial}"))),
        n => Ok(((n - 12) / 2) as usize),
    }
}

fn text_len(s: &str, encoding: TextEncoding) -> usize {
    match encoding {
        TextEncoding::Utf8 => s.len(),
        TextEncoding::Utf16Le | TextEncoding::Utf16Be => s.encode_utf16().count() * 2,
    }
}

pub fn encode_record(values: &[Value]) -> Vec<u8> {
    encode_record_with(values, TextEncoding::Utf8)
}

pub fn encode_record_with(values: &[Value], encoding: TextEncoding) -> Vec<u8> {
    let types: Vec<(u64, usize)> = values.iter().map(|v| serial_type(v, encoding)).collect();
    let types_len: usize = types.iter().map(|(t, _)| varint_len(*t)).sum();
    // The length prefix counts its own bytes.
    let mut header_len = types_len + 1;
    loop {
        let total = types_len + varint_len(header_len as u64);
        if total == header_len {
            break;
        }
        header_len = total;
    }
    let body_len: usize = types.iter().map(|(_, len)| *len).sum();

    let mut out = vec![0u8; header_len + body_len];
    let mut pos = put_varint(&mut out, header_len as u64);
    for (serial, _) in &types {
        pos += put_varint(&mut out[pos..], *serial);
    }
    debug_assert_eq!(pos, header_len);

    for (value, (serial, len)) in values.iter().zip(&types) {
        let body = &mut out[pos..pos + len];
        match value {
            Value::Integer(i) if (1..=6).contains(serial) => {
                body.copy_from_slice(&i.to_be_bytes()[8 - len..]);
            }
            Value::Real(r) if *serial == SERIAL_FLOAT => body.copy_from_slice(&r.to_bits().to_be_bytes()),
            Value::Text(s) => encode_text(s, encoding, body),
            Value::Blob(b) => body.copy_from_slice(b),
            _ => {}
        }
        pos += len;
    }
    out
}

fn encode_text(s: &str, encoding: TextEncoding, out: &mut [u8]) {
    match encoding {
        TextEncoding::Utf8 => out.copy_from_slice(s.as_bytes()),
        TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
            for (chunk, unit) in out.chunks_exact_mut(2).zip(s.encode_utf16()) {
                let bytes = if encoding == TextEncoding::Utf16Le {
                    unit.to_le_bytes()
                } else {
                    unit.to_be_bytes()
                };
                chunk.copy_from_slice(&bytes);
            }
        }
    }
}

pub fn decode_record(data: &[u8]) -> Result<Vec<Value>> {
    decode_record_with(data, TextEncoding::Utf8)
}

pub fn decode_record_with(data: &[u8], encoding: TextEncoding) -> Result<Vec<Value>> {
    let (header_len, mut pos) =
        try_get_varint(data).ok_or_else(|| Error::corrupt("truncated record header"))?;
    let header_len = header_len as usize;
    if header_len < pos || header_len > data.len() {
        return Err(Error::corrupt(format!(
            "record header length {header_len} out of range"
        )));
    }

    let mut body = header_len;
    let mut values = Vec::new();
    while pos < header_len {
        let (serial, n) = try_get_varint(&data[pos..header_len])
            .ok_or_else(|| Error::corrupt("truncated serial type"))?;
        pos += n;
        let len = serial_type_len(serial)?;
        if body + len > data.len() {
            return Err(Error::corrupt("record body overruns its payload"));
        }
        values.push(decode_value(serial, &data[body..body + len], encoding)?);
        body += len;
    }
    Ok(values)
}

fn decode_value(serial: u64, body: &[u8], encoding: TextEncoding) -> Result<Value> {
    let p = Pointer::new(body);
    Ok(match serial {
        SERIAL_NULL => Value::Null,
        1..=6 => Value::Integer(p.get_signed(0, body.len())),
        SERIAL_FLOAT => Value::Real(f64::from_bits(p.get_u64(0))),
        SERIAL_ZERO => Value::Integer(0),
        SERIAL_ONE => Value::Integer(1),
        n if n % 2 == 0 => Value::Blob(body.to_vec()),
        _ => Value::Text(decode_text(body, encoding)?),
    })
}

fn decode_text(body: &[u8], encoding: TextEncoding) -> Result<String> {
    match encoding {
        TextEncoding::Utf8 => String::from_utf8(body.to_vec())
            .map_err(|_| Error::corrupt("text field is not valid UTF-8")),
        TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
            if body.len() % 2 != 0 {
                return Err(Error::corrupt("UTF-16 text field has odd length"));
            }
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|c| {
                    let pair = [c[0], c[1]];
                    if encoding == TextEncoding::Utf16Le {
                        u16::from_le_bytes(pair)
                    } else {
                        u16::from_be_bytes(pair)
                    }
                })
                .collect();
            String::from_utf16(&units).map_err(|_| Error::corrupt("text field is not valid UTF-16"))
        }
    }
}

/// Number of fields, reading only the header.
pub fn field_count(data: &[u8]) -> Result<usize> {
    let (header_len, mut pos) =
        try_get_varint(data).ok_or_else(|| Error::corrupt("truncated record header"))?;
    let header_len = (header_len as usize).min(data.len());
    let mut count = 0;
    while pos < header_len {
        let (_, n) = try_get_varint(&data[pos..header_len])
            .ok_or_else(|| Error::corrupt("truncated serial type"))?;
        pos += n;
        count += 1;
    }
    Ok(count)
}
