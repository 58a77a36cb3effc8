//! Length prefixes. The top two bits of the first byte select the form:
//!
//! * `00` - 6-bit length in the same byte
//! * `01` - 14-bit big-endian length across two bytes
//! * `10` - `0x80` then a 32-bit, or `0x81` then a 64-bit, big-endian length
//! * `11` - special encoding; `C0`/`C1`/`C2` are 8/16/32-bit little-endian
//!   integers standing in for a string

use bytes::{BufMut, BytesMut};

use super::Reader;

/// What a length prefix announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    Length(u64),
    Integer(i64),
}

pub fn put_length(dst: &mut BytesMut, len: u64) {
    if len < 1 << 6 {
        dst.put_u8(len as u8);
    } else if len < 1 << 14 {
        dst.put_u16(0x4000 | len as u16);
    } else if len <= u32::MAX as u64 {
        dst.put_u8(0x80);
        dst.put_u32(len as u32);
    } else {
        dst.put_u8(0x81);
        dst.put_u64(len);
    }
}

/// Writes a length-prefixed string, using the integer form when `value` is
/// the canonical text of a 32-bit integer.
pub fn put_string(dst: &mut BytesMut, value: &[u8]) {
    match as_integer(value) {
        Some(n) if i8::try_from(n).is_ok() => {
            dst.put_u8(0xC0);
            dst.put_i8(n as i8);
        }
        Some(n) if i16::try_from(n).is_ok() => {
            dst.put_u8(0xC1);
            dst.put_i16_le(n as i16);
        }
        Some(n) if i32::try_from(n).is_ok() => {
            dst.put_u8(0xC2);
            dst.put_i32_le(n as i32);
        }
        _ => {
            put_length(dst, value.len() as u64);
            dst.put_slice(value);
        }
    }
}

fn as_integer(value: &[u8]) -> Option<i64> {
    if value.is_empty() || value.len() > 11 {
        return None;
    }

    let n: i64 = std::str::from_utf8(value).ok()?.parse().ok()?;

    // "007" or "+1" parse fine but would not survive the round trip.
    (n.to_string().as_bytes() == value).then_some(n)
}

pub fn read(src: &mut Reader<'_>) -> Result<Encoded, String> {
    let first = src.u8()?;

    match first >> 6 {
        0b00 => Ok(Encoded::Length((first & 0x3F) as u64)),
        0b01 => {
            let second = src.u8()?;
            Ok(Encoded::Length((((first & 0x3F) as u64) << 8) | second as u64))
        }
        _ if first == 0x80 => Ok(Encoded::Length(src.u32_be()? as u64)),
        _ if first == 0x81 => Ok(Encoded::Length(src.u64_be()?)),
        0b11 => match first & 0x3F {
            0 => Ok(Encoded::Integer(src.u8()? as i8 as i64)),
            1 => Ok(Encoded::Integer(i16::from_le_bytes(src.array()?) as i64)),
            2 => Ok(Encoded::Integer(i32::from_le_bytes(src.array()?) as i64)),
            3 => Err("compressed strings are not supported".into()),
            other => Err(format!("unknown special encoding {other}")),
        },
        _ => Err(format!("invalid length prefix 0x{first:02x}")),
    }
}

/// Reads a plain length; the integer forms are rejected.
pub fn read_length(src: &mut Reader<'_>) -> Result<u64, String> {
    match read(src)? {
        Encoded::Length(len) => Ok(len),
        Encoded::Integer(_) => Err("expected a length, found an integer encoding".into()),
    }
}

pub fn read_string(src: &mut Reader<'_>) -> Result<Vec<u8>, String> {
    match read(src)? {
        Encoded::Length(len) => {
            let len = usize::try_from(len).map_err(|_| format!("string length {len} too large"))?;
            Ok(src.take(len)?.to_vec())
        }
        Encoded::Integer(n) => Ok(n.to_string().into_bytes()),
    }
}
