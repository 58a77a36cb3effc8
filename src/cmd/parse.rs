use std::{fmt, str, vec};

use bytes::Bytes;

use crate::frame::Frame;

/// Cursor over the arguments of a command array.
///
/// Commands arrive as arrays of bulk strings; each `next_*` call consumes one
/// argument and converts it to the requested shape.
#[derive(Debug)]
pub(crate) struct Parse {
    parts: vec::IntoIter<Frame>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ParseError {
    /// Ran out of arguments.
    EndOfStream,
    Other(String),
}

impl Parse {
    pub(crate) fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(array) if !array.is_empty() => array,
            frame => return Err(format!("expected a command array, got {frame}").into()),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    fn next(&mut self) -> Result<Frame, ParseError> {
        self.parts.next().ok_or(ParseError::EndOfStream)
    }

    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            Frame::Bulk(bytes) => Ok(bytes),
            Frame::Simple(text) => Ok(Bytes::from(text)),
            Frame::Integer(n) => Ok(Bytes::from(n.to_string())),
            frame => Err(format!("expected a string argument, got {frame}").into()),
        }
    }

    pub(crate) fn next_string(&mut self) -> Result<String, ParseError> {
        let bytes = self.next_bytes()?;

        String::from_utf8(bytes.to_vec()).map_err(|_| "argument is not valid UTF-8".into())
    }

    pub(crate) fn next_int(&mut self) -> Result<i64, ParseError> {
        const MSG: &str = "value is not an integer or out of range";

        let bytes = self.next_bytes()?;
        let text = str::from_utf8(&bytes).map_err(|_| ParseError::from(MSG))?;

        text.parse::<i64>().map_err(|_| MSG.into())
    }

    pub(crate) fn next_float(&mut self) -> Result<f64, ParseError> {
        const MSG: &str = "value is not a valid float";

        let bytes = self.next_bytes()?;
        let text = str::from_utf8(&bytes).map_err(|_| ParseError::from(MSG))?;

        match text.parse::<f64>() {
            Ok(value) if !value.is_nan() => Ok(value),
            _ => Err(MSG.into()),
        }
    }

    /// Next argument, if any, without failing at the end.
    pub(crate) fn try_next_string(&mut self) -> Result<Option<String>, ParseError> {
        match self.next_string() {
            Ok(value) => Ok(Some(value)),
            Err(ParseError::EndOfStream) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.parts.len()
    }

    pub(crate) fn finish(&mut self) -> Result<(), ParseError> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err("syntax error".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(src)
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        src.to_string().into()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EndOfStream => write!(f, "protocol error; unexpected end of stream"),
            ParseError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_arguments() {
        let mut parse = Parse::new(Frame::command(["SET", "k", "42", "1.5"])).unwrap();

        assert_eq!(parse.next_string().unwrap(), "SET");
        assert_eq!(parse.next_bytes().unwrap(), Bytes::from("k"));
        assert_eq!(parse.remaining(), 2);
        assert_eq!(parse.next_int().unwrap(), 42);
        assert_eq!(parse.next_float().unwrap(), 1.5);
        assert_eq!(parse.try_next_string().unwrap(), None);
        assert!(parse.finish().is_ok());
    }

    #[test]
    fn rejects_bad_numbers() {
        let mut parse = Parse::new(Frame::command(["x", "nan"])).unwrap();
        assert!(matches!(parse.next_int(), Err(ParseError::Other(_))));
        assert!(matches!(parse.next_float(), Err(ParseError::Other(_))));
        assert_eq!(parse.next_float(), Err(ParseError::EndOfStream));
    }

    #[test]
    fn rejects_non_arrays() {
        assert!(Parse::new(Frame::simple("PING")).is_err());
        assert!(Parse::new(Frame::array()).is_err());
    }
}
