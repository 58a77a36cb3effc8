use bytes::Bytes;
use tokio::time::Duration;

use crate::db::Db;
use crate::frame::Frame;
use crate::state::ServerState;

use super::parse::{Parse, ParseError};
use super::{block_until, deadline_after, CommandError, Outcome, Session};

/// RPUSH and LPUSH.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    key: String,
    values: Vec<Bytes>,
    front: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LPop {
    key: String,
    /// Present when the caller asked for a count, which switches the reply to
    /// an array.
    count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BLPop {
    keys: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LRange {
    key: String,
    start: i64,
    stop: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LLen {
    key: String,
}

impl Push {
    pub(crate) fn parse_frames(parse: &mut Parse, front: bool) -> Result<Push, CommandError> {
        let key = parse.next_string()?;

        let mut values = vec![parse.next_bytes()?];
        loop {
            match parse.next_bytes() {
                Ok(value) => values.push(value),
                Err(ParseError::EndOfStream) => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Push { key, values, front })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let len = db.push(&self.key, self.values, self.front)?;

        Ok(Frame::Integer(len as i64))
    }
}

impl LPop {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<LPop, CommandError> {
        let key = parse.next_string()?;

        let count = match parse.next_int() {
            Ok(count) if count < 0 => {
                return Err(CommandError::Invalid("value is out of range, must be positive".into()))
            }
            Ok(count) => Some(count as usize),
            Err(ParseError::EndOfStream) => None,
            Err(err) => return Err(err.into()),
        };

        Ok(LPop { key, count })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        match self.count {
            None => Ok(Frame::bulk_or_nil(db.pop_front(&self.key, 1)?.pop())),
            Some(count) => {
                let popped = db.pop_front(&self.key, count)?;
                if popped.is_empty() {
                    return Ok(Frame::NullArray);
                }
                Ok(Frame::command(popped))
            }
        }
    }
}

impl BLPop {
    /// `BLPOP key [key ...] timeout`, the timeout in (fractional) seconds.
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<BLPop, CommandError> {
        let mut args = vec![];
        while let Some(arg) = parse.try_next_string()? {
            args.push(arg);
        }

        let timeout = args.pop().ok_or(CommandError::MissingArgument)?;
        let seconds: f64 = timeout.parse().map_err(|_| CommandError::InvalidTimeout)?;
        if seconds < 0.0 {
            return Err(CommandError::NegativeTimeout);
        }
        let timeout = Duration::try_from_secs_f64(seconds).map_err(|_| CommandError::InvalidTimeout)?;

        Ok(BLPop { keys: args, timeout })
    }

    /// One pop attempt. On success the reply is `[key, value]`; replicas are
    /// told about it as a plain `LPOP key`.
    pub(crate) fn try_pop(&self, forwards: bool, db: &Db) -> Option<Outcome> {
        let popped = match db.pop_first_of(&self.keys) {
            Ok(popped) => popped?,
            Err(err) => return Some(Outcome::error(err.into())),
        };
        let (key, value) = popped;

        let replicate = forwards.then(|| Frame::command([Bytes::from("LPOP"), Bytes::from(key.clone())]).to_bytes());

        Some(Outcome {
            replicate,
            ..Outcome::reply(Frame::command([Bytes::from(key), value]))
        })
    }

    /// Waits for one of the lists to receive an element. Each attempt runs
    /// under the write-order lock so the pop and its forward stay together.
    pub(crate) async fn apply_blocking(self, session: &Session, state: &ServerState) -> Outcome {
        let forwards = session.forwards_writes(state);
        let deadline = deadline_after(self.timeout);

        let popped = block_until(state, deadline, || {
            state.ordered(|| {
                let outcome = self.try_pop(forwards, &state.db)?;
                if let Some(payload) = &outcome.replicate {
                    state.replication.forward(payload.clone());
                }
                Some(outcome)
            })
        })
        .await;

        popped.unwrap_or_else(|| Outcome::reply(Frame::NullArray))
    }
}

impl LRange {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<LRange, CommandError> {
        Ok(LRange {
            key: parse.next_string()?,
            start: parse.next_int()?,
            stop: parse.next_int()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::command(db.list_range(&self.key, self.start, self.stop)?))
    }
}

impl LLen {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<LLen, CommandError> {
        Ok(LLen {
            key: parse.next_string()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.list_len(&self.key)? as i64))
    }
}
