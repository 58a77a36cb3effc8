use bytes::Bytes;

use crate::db::{now_millis, Db, Expiry, SetCondition, StoreError, Value};
use crate::frame::Frame;

use super::parse::Parse;
use super::CommandError;

#[derive(Debug, Clone, PartialEq)]
pub struct Get {
    key: String,
}

/// Expiry as given on the command line. Relative forms are resolved when the
/// command runs, not when it is parsed, so a queued SET counts from EXEC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetExpiry {
    Clear,
    Keep,
    In(u64),
    At(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    key: String,
    value: Bytes,
    expiry: SetExpiry,
    condition: Option<SetCondition>,
    get: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Incr {
    key: String,
}

impl Get {
    pub fn new(key: impl ToString) -> Get {
        Get {
            key: key.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::command([Bytes::from("GET"), Bytes::from(self.key)])
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Get, CommandError> {
        let key = parse.next_string()?;

        Ok(Get { key })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        match db.get(&self.key) {
            None => Ok(Frame::NullBulk),
            Some(Value::String(value)) => Ok(Frame::Bulk(value)),
            Some(_) => Err(StoreError::WrongType.into()),
        }
    }
}

impl Set {
    pub fn new(key: impl ToString, value: Bytes) -> Set {
        Set {
            key: key.to_string(),
            value,
            expiry: SetExpiry::Clear,
            condition: None,
            get: false,
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::command([Bytes::from("SET"), Bytes::from(self.key), self.value])
    }

    /// `SET key value [NX | XX] [GET] [EX s | PX ms | EXAT s | PXAT ms | KEEPTTL]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Set, CommandError> {
        let mut set = Set::new(parse.next_string()?, parse.next_bytes()?);
        let mut expiry_given = false;

        while let Some(option) = parse.try_next_string()? {
            let option = option.to_uppercase();

            match option.as_str() {
                "NX" | "XX" => {
                    if set.condition.is_some() {
                        return Err(CommandError::Syntax);
                    }
                    set.condition = Some(if option == "NX" {
                        SetCondition::IfAbsent
                    } else {
                        SetCondition::IfPresent
                    });
                }
                "GET" => set.get = true,
                "KEEPTTL" | "EX" | "PX" | "EXAT" | "PXAT" => {
                    if expiry_given {
                        return Err(CommandError::Syntax);
                    }
                    expiry_given = true;

                    set.expiry = match option.as_str() {
                        "KEEPTTL" => SetExpiry::Keep,
                        unit => expiry_arg(parse, unit)?,
                    };
                }
                _ => return Err(CommandError::Syntax),
            }
        }

        Ok(set)
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let expiry = match self.expiry {
            SetExpiry::Clear => Expiry::Clear,
            SetExpiry::Keep => Expiry::Keep,
            SetExpiry::In(ms) => Expiry::At(now_millis().saturating_add(ms)),
            SetExpiry::At(at) => Expiry::At(at),
        };

        let outcome = db.set_string(&self.key, self.value, expiry, self.condition, self.get)?;

        Ok(match (self.get, outcome.applied) {
            (true, _) => Frame::bulk_or_nil(outcome.previous),
            (false, true) => Frame::ok(),
            (false, false) => Frame::NullBulk,
        })
    }
}

fn expiry_arg(parse: &mut Parse, unit: &str) -> Result<SetExpiry, CommandError> {
    let invalid = || CommandError::InvalidExpire("set".into());

    let amount = parse.next_int().map_err(|err| match err {
        super::parse::ParseError::EndOfStream => CommandError::Syntax,
        err => err.into(),
    })?;
    if amount <= 0 {
        return Err(invalid());
    }
    let amount = amount as u64;

    match unit {
        "EX" => amount.checked_mul(1000).map(SetExpiry::In).ok_or_else(invalid),
        "PX" => Ok(SetExpiry::In(amount)),
        "EXAT" => amount.checked_mul(1000).map(SetExpiry::At).ok_or_else(invalid),
        _ => Ok(SetExpiry::At(amount)),
    }
}

impl Incr {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Incr, CommandError> {
        Ok(Incr {
            key: parse.next_string()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.incr(&self.key)?))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn set(args: &[&str]) -> Result<Set, CommandError> {
        let frame = Frame::command(args.iter().map(|arg| Bytes::copy_from_slice(arg.as_bytes())));
        Set::parse_frames(&mut Parse::new(frame).unwrap())
    }

    #[test]
    fn option_parsing() {
        let parsed = set(&["k", "v", "px", "100", "NX"]).unwrap();
        assert_eq!(parsed.expiry, SetExpiry::In(100));
        assert_eq!(parsed.condition, Some(SetCondition::IfAbsent));

        assert_eq!(set(&["k", "v", "EX", "2"]).unwrap().expiry, SetExpiry::In(2000));
        assert_eq!(set(&["k", "v", "PXAT", "5"]).unwrap().expiry, SetExpiry::At(5));
        assert_eq!(set(&["k", "v", "KEEPTTL"]).unwrap().expiry, SetExpiry::Keep);
    }

    #[test]
    fn option_errors() {
        assert_eq!(set(&["k", "v", "EX", "0"]), Err(CommandError::InvalidExpire("set".into())));
        assert_eq!(set(&["k", "v", "PX", "-5"]), Err(CommandError::InvalidExpire("set".into())));
        assert_eq!(set(&["k", "v", "EX"]), Err(CommandError::Syntax));
        assert_eq!(set(&["k", "v", "NX", "XX"]), Err(CommandError::Syntax));
        assert_eq!(set(&["k", "v", "EX", "1", "PX", "1"]), Err(CommandError::Syntax));
        assert_eq!(set(&["k", "v", "BOGUS"]), Err(CommandError::Syntax));
        assert!(matches!(set(&["k", "v", "EX", "soon"]), Err(CommandError::Invalid(_))));
    }

    #[test]
    fn set_px_then_expire() {
        let db = Db::new();
        assert_eq!(set(&["k", "v", "PX", "10"]).unwrap().apply(&db), Ok(Frame::ok()));
        assert_eq!(Get::new("k").apply(&db), Ok(Frame::bulk("v")));

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(Get::new("k").apply(&db), Ok(Frame::NullBulk));
        assert!(db.keys("*").is_empty());
    }

    #[test]
    fn set_get_returns_previous() {
        let db = Db::new();
        assert_eq!(set(&["k", "1", "GET"]).unwrap().apply(&db), Ok(Frame::NullBulk));
        assert_eq!(set(&["k", "2", "GET"]).unwrap().apply(&db), Ok(Frame::bulk("1")));
        assert_eq!(set(&["k", "3", "NX"]).unwrap().apply(&db), Ok(Frame::NullBulk));
        assert_eq!(Get::new("k").apply(&db), Ok(Frame::bulk("2")));
    }

    #[test]
    fn get_wrong_type() {
        let db = Db::new();
        db.push("l", vec![Bytes::from("x")], false).unwrap();

        assert_eq!(
            Get::new("l").apply(&db),
            Err(CommandError::Store(StoreError::WrongType))
        );
    }
}
