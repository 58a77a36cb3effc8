//! Wire codec for the request/response protocol.
//!
//! Every scalar is terminated by `\r\n`. Binary strings are length prefixed so
//! their payload may contain any byte, separators included. Aggregates carry an
//! element (or pair) count followed by the recursively encoded members.
//!
//! Decoding is two-phase: [`Frame::check`] walks the buffer without allocating
//! and reports [`Error::Incomplete`] when the bytes seen so far are a proper
//! prefix of a valid encoding. Only once a whole frame is known to be present
//! does [`Frame::parse`] build it, so a partial read never leaves a half-built
//! value behind.

use std::io::Cursor;
use std::{fmt, str};

use atoi::FromRadix10SignedChecked;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const SEPARATOR: &[u8] = b"\r\n";

/// Deepest aggregate nesting accepted from the wire.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),           // +
    Error(String),            // -
    Integer(i64),             // :
    Bulk(Bytes),              // $
    NullBulk,                 // $-1
    Null,                     // _
    Boolean(bool),            // #
    Double(f64),              // ,
    BigNumber(String),        // (
    Array(Vec<Frame>),        // *
    NullArray,                // *-1
    Map(Vec<(Frame, Frame)>), // %
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data buffered to decode a full frame. Read more and retry.
    Incomplete,
    Protocol(String),
}

impl Frame {
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    /// Builds the canonical command encoding: an array of binary strings.
    pub fn command<I, T>(args: I) -> Frame
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Frame::Array(args.into_iter().map(|arg| Frame::Bulk(arg.into())).collect())
    }

    pub fn simple(value: impl Into<String>) -> Frame {
        Frame::Simple(value.into())
    }

    pub fn error(message: impl Into<String>) -> Frame {
        Frame::Error(message.into())
    }

    pub fn bulk(value: impl Into<Bytes>) -> Frame {
        Frame::Bulk(value.into())
    }

    /// Bulk string when present, the nil bulk string when absent.
    pub fn bulk_or_nil(value: Option<Bytes>) -> Frame {
        value.map_or(Frame::NullBulk, Frame::Bulk)
    }

    pub fn ok() -> Frame {
        Frame::Simple("OK".to_string())
    }

    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => vec.push(Frame::Bulk(bytes)),
            _ => panic!("not an array frame"),
        }
    }

    pub fn push_frame(&mut self, frame: Frame) {
        match self {
            Frame::Array(vec) => vec.push(frame),
            _ => panic!("not an array frame"),
        }
    }

    /// Checks whether a whole frame can be decoded from `src`, advancing the
    /// cursor past it.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        Frame::check_nested(src, 0)
    }

    fn check_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<(), Error> {
        match get_descriptor(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                get_integer(src)?;
                Ok(())
            }
            b'_' => get_null(src),
            b'#' => {
                get_boolean(src)?;
                Ok(())
            }
            b',' => {
                get_double(src)?;
                Ok(())
            }
            b'(' => {
                get_big_number(src)?;
                Ok(())
            }
            b'$' => match get_length(src)? {
                None => Ok(()),
                Some(len) => {
                    get_bulk(src, len)?;
                    Ok(())
                }
            },
            b'*' => {
                if let Some(len) = get_length(src)? {
                    let depth = nest(depth)?;
                    for _ in 0..len {
                        Frame::check_nested(src, depth)?;
                    }
                }
                Ok(())
            }
            b'%' => match get_length(src)? {
                None => Err(protocol("null map is not a valid frame")),
                Some(len) => {
                    let depth = nest(depth)?;
                    for _ in 0..len {
                        Frame::check_nested(src, depth)?;
                        Frame::check_nested(src, depth)?;
                    }
                    Ok(())
                }
            },
            other => Err(protocol(format!("invalid frame type byte `{}`", other as char))),
        }
    }

    /// Parses a frame previously validated with [`Frame::check`].
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        Frame::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, Error> {
        match get_descriptor(src)? {
            b'+' => Ok(Frame::Simple(get_text(src)?)),
            b'-' => Ok(Frame::Error(get_text(src)?)),
            b':' => Ok(Frame::Integer(get_integer(src)?)),
            b'_' => {
                get_null(src)?;
                Ok(Frame::Null)
            }
            b'#' => Ok(Frame::Boolean(get_boolean(src)?)),
            b',' => Ok(Frame::Double(get_double(src)?)),
            b'(' => Ok(Frame::BigNumber(get_big_number(src)?)),
            b'$' => match get_length(src)? {
                None => Ok(Frame::NullBulk),
                Some(len) => Ok(Frame::Bulk(Bytes::copy_from_slice(get_bulk(src, len)?))),
            },
            b'*' => match get_length(src)? {
                None => Ok(Frame::NullArray),
                Some(len) => {
                    let depth = nest(depth)?;
                    let mut array = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        array.push(Frame::parse_nested(src, depth)?);
                    }
                    Ok(Frame::Array(array))
                }
            },
            b'%' => match get_length(src)? {
                None => Err(protocol("null map is not a valid frame")),
                Some(len) => {
                    let depth = nest(depth)?;
                    let mut pairs = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        let key = Frame::parse_nested(src, depth)?;
                        let value = Frame::parse_nested(src, depth)?;
                        pairs.push((key, value));
                    }
                    Ok(Frame::Map(pairs))
                }
            },
            other => Err(protocol(format!("invalid frame type byte `{}`", other as char))),
        }
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` only holds a prefix of a frame, otherwise
    /// the frame together with the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, Error> {
        let mut cursor = Cursor::new(buf);

        match Frame::check(&mut cursor) {
            Ok(()) => {
                let len = cursor.position() as usize;
                cursor.set_position(0);

                let frame = Frame::parse(&mut cursor)?;

                Ok(Some((frame, len)))
            }
            Err(Error::Incomplete) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(string) => {
                dst.put_u8(b'+');
                put_line(dst, string);
            }
            Frame::Error(string) => {
                dst.put_u8(b'-');
                put_line(dst, string);
            }
            Frame::Integer(value) => {
                dst.put_u8(b':');
                put_decimal(dst, *value);
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                put_decimal(dst, data.len() as i64);
                dst.put_slice(data);
                dst.put_slice(SEPARATOR);
            }
            Frame::NullBulk => dst.put_slice(b"$-1\r\n"),
            Frame::Null => dst.put_slice(b"_\r\n"),
            Frame::Boolean(value) => dst.put_slice(if *value { b"#t\r\n" } else { b"#f\r\n" }),
            Frame::Double(value) => {
                dst.put_u8(b',');
                let text = if value.is_nan() {
                    "nan".to_string()
                } else {
                    value.to_string()
                };
                dst.put_slice(text.as_bytes());
                dst.put_slice(SEPARATOR);
            }
            Frame::BigNumber(digits) => {
                dst.put_u8(b'(');
                put_line(dst, digits);
            }
            Frame::Array(items) => {
                dst.put_u8(b'*');
                put_decimal(dst, items.len() as i64);
                for item in items {
                    item.encode(dst);
                }
            }
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
            Frame::Map(pairs) => {
                dst.put_u8(b'%');
                put_decimal(dst, pairs.len() as i64);
                for (key, value) in pairs {
                    key.encode(dst);
                    value.encode(dst);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn protocol(msg: impl Into<String>) -> Error {
    Error::Protocol(msg.into())
}

fn nest(depth: usize) -> Result<usize, Error> {
    if depth >= MAX_DEPTH {
        return Err(protocol(format!("aggregates nested deeper than {MAX_DEPTH}")));
    }
    Ok(depth + 1)
}

/// Simple strings and errors are separator terminated, so any CR or LF in the
/// body is flattened to a space.
fn put_line(dst: &mut BytesMut, line: &str) {
    if line.bytes().any(|b| b == b'\r' || b == b'\n') {
        dst.put_slice(line.replace(&['\r', '\n'][..], " ").as_bytes());
    } else {
        dst.put_slice(line.as_bytes());
    }
    dst.put_slice(SEPARATOR);
}

fn put_decimal(dst: &mut BytesMut, value: i64) {
    dst.put_slice(value.to_string().as_bytes());
    dst.put_slice(SEPARATOR);
}

fn get_descriptor(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

/// A "line" is a run of bytes terminated by `\r\n`; the terminator is consumed
/// but not returned.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();
    let end = buf.len().saturating_sub(1);

    for i in start..end {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);

            return Ok(&buf[start..i]);
        }
    }

    Err(Error::Incomplete)
}

fn get_text(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let line = get_line(src)?;

    String::from_utf8(line.to_vec()).map_err(|_| protocol("invalid frame format; not utf-8"))
}

fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;

    match i64::from_radix_10_signed_checked(line) {
        (Some(value), used) if used == line.len() && used > 0 => Ok(value),
        _ => Err(protocol(format!(
            "invalid integer `{}`",
            String::from_utf8_lossy(line)
        ))),
    }
}

/// Reads an aggregate or bulk length; `-1` means the null value of that type.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    match get_integer(src)? {
        -1 => Ok(None),
        len if len >= 0 => Ok(Some(len as usize)),
        len => Err(protocol(format!("invalid length {}", len))),
    }
}

fn get_bulk<'a>(src: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], Error> {
    let n = len + SEPARATOR.len();

    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    if &buf[start + len..start + n] != SEPARATOR {
        return Err(protocol(format!(
            "bulk string length {} does not match its payload",
            len
        )));
    }

    src.advance(n);

    Ok(&buf[start..start + len])
}

fn get_null(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
    if !get_line(src)?.is_empty() {
        return Err(protocol("null frame carries a payload"));
    }

    Ok(())
}

fn get_boolean(src: &mut Cursor<&[u8]>) -> Result<bool, Error> {
    match get_line(src)? {
        b"t" => Ok(true),
        b"f" => Ok(false),
        other => Err(protocol(format!(
            "invalid boolean `{}`",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn get_double(src: &mut Cursor<&[u8]>) -> Result<f64, Error> {
    let line = get_line(src)?;

    str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .ok_or_else(|| {
            protocol(format!(
                "invalid double `{}`",
                String::from_utf8_lossy(line)
            ))
        })
}

fn get_big_number(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let line = get_line(src)?;
    let digits = line.strip_prefix(b"-").or_else(|| line.strip_prefix(b"+")).unwrap_or(line);

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(protocol(format!(
            "invalid big number `{}`",
            String::from_utf8_lossy(line)
        )));
    }

    // checked above: sign plus ascii digits
    Ok(String::from_utf8_lossy(line).into_owned())
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Simple(string) => write!(f, "{}", string),
            Frame::Error(string) => write!(f, "(error) {}", string),
            Frame::Integer(value) => write!(f, "(integer) {}", value),
            Frame::Bulk(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Frame::NullBulk | Frame::Null | Frame::NullArray => write!(f, "(nil)"),
            Frame::Boolean(value) => write!(f, "({})", value),
            Frame::Double(value) => write!(f, "(double) {}", value),
            Frame::BigNumber(digits) => write!(f, "(big number) {}", digits),
            Frame::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Frame::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
            Frame::Map(pairs) => {
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}# {} => {}", i + 1, key, value)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => write!(fmt, "stream ended early"),
            Error::Protocol(msg) => write!(fmt, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Frame> {
        vec![
            Frame::simple("OK"),
            Frame::error("ERR nope"),
            Frame::Integer(-42),
            Frame::bulk("hello"),
            Frame::bulk(Bytes::from_static(b"a\r\nb")),
            Frame::bulk(""),
            Frame::NullBulk,
            Frame::Null,
            Frame::Boolean(true),
            Frame::Boolean(false),
            Frame::Double(3.25),
            Frame::Double(f64::INFINITY),
            Frame::BigNumber("-3492890328409238509324850943850943825024385".into()),
            Frame::NullArray,
            Frame::command(["SET", "k", "v"]),
            Frame::Array(vec![
                Frame::Integer(1),
                Frame::Array(vec![Frame::bulk("nested"), Frame::Null]),
            ]),
            Frame::Map(vec![
                (Frame::simple("first"), Frame::Integer(1)),
                (Frame::bulk("second"), Frame::Array(vec![Frame::Double(0.5)])),
            ]),
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        for frame in samples() {
            let encoded = frame.to_bytes();
            let (decoded, len) = Frame::decode(&encoded).unwrap().unwrap();

            assert_eq!(decoded, frame);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn every_proper_prefix_is_incomplete() {
        for frame in samples() {
            let encoded = frame.to_bytes();

            for end in 0..encoded.len() {
                match Frame::decode(&encoded[..end]) {
                    Ok(None) => {}
                    other => panic!("prefix {:?} of {:?} gave {:?}", &encoded[..end], frame, other),
                }
            }
        }
    }

    #[test]
    fn deep_nesting_is_a_protocol_error() {
        let mut deep = b"*1\r\n".repeat(500_000);
        deep.extend_from_slice(b":1\r\n");
        assert!(matches!(Frame::decode(&deep), Err(Error::Protocol(_))));

        let mut limit = b"*1\r\n".repeat(MAX_DEPTH);
        limit.extend_from_slice(b":1\r\n");
        let (_, len) = Frame::decode(&limit).unwrap().unwrap();
        assert_eq!(len, limit.len());
    }

    #[test]
    fn decode_stops_at_frame_boundary() {
        let buf = b"+PONG\r\n:1\r\n";
        let (frame, len) = Frame::decode(buf).unwrap().unwrap();

        assert_eq!(frame, Frame::simple("PONG"));
        assert_eq!(len, 7);
    }

    #[test]
    fn ping_command_bytes() {
        let (frame, _) = Frame::decode(b"*1\r\n$4\r\nPING\r\n").unwrap().unwrap();

        assert_eq!(frame, Frame::command(["PING"]));
        assert_eq!(&Frame::simple("PONG").to_bytes()[..], b"+PONG\r\n");
    }

    #[test]
    fn nil_and_empty_bulk_differ() {
        assert_eq!(&Frame::NullBulk.to_bytes()[..], b"$-1\r\n");
        assert_eq!(&Frame::bulk("").to_bytes()[..], b"$0\r\n\r\n");
    }

    #[test]
    fn unknown_type_byte_is_protocol_error() {
        assert!(matches!(Frame::decode(b"?what\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn bulk_length_mismatch_is_protocol_error() {
        assert!(matches!(Frame::decode(b"$2\r\nabc\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(Frame::decode(b"$x\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(Frame::decode(b"*-5\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn simple_string_never_carries_separator() {
        let encoded = Frame::error("ERR bad\r\nthing").to_bytes();

        assert_eq!(&encoded[..], b"-ERR bad  thing\r\n");
    }
}
