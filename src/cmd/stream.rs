use bytes::Bytes;
use tokio::time::Duration;

use crate::db::{Db, IdSpec, StreamEntry, StreamId};
use crate::frame::Frame;
use crate::state::ServerState;

use super::parse::Parse;
use super::{block_until, deadline_after, CommandError, Outcome};

#[derive(Debug, Clone, PartialEq)]
pub struct XAdd {
    key: String,
    id: IdSpec,
    fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XRange {
    key: String,
    start: StreamId,
    end: StreamId,
    count: Option<usize>,
}

/// Where an XREAD starts reading a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFrom {
    After(StreamId),
    /// `$`: only entries added after the command started.
    Latest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XRead {
    count: Option<usize>,
    /// Milliseconds; zero blocks forever.
    block: Option<u64>,
    streams: Vec<(String, ReadFrom)>,
}

impl XAdd {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<XAdd, CommandError> {
        let key = parse.next_string()?;
        let id = IdSpec::parse(&parse.next_string()?)?;

        if parse.remaining() == 0 || parse.remaining() % 2 != 0 {
            return Err(CommandError::WrongArity("XADD".into()));
        }

        let mut fields = Vec::with_capacity(parse.remaining() / 2);
        while parse.remaining() > 0 {
            fields.push((parse.next_bytes()?, parse.next_bytes()?));
        }

        Ok(XAdd { key, id, fields })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let id = db.xadd(&self.key, self.id, self.fields)?;

        Ok(Frame::bulk(id.to_string()))
    }
}

impl XRange {
    /// `XRANGE key start end [COUNT n]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<XRange, CommandError> {
        let key = parse.next_string()?;
        let start = StreamId::parse_bound(&parse.next_string()?, true)?;
        let end = StreamId::parse_bound(&parse.next_string()?, false)?;

        let count = match parse.try_next_string()? {
            Some(option) if option.eq_ignore_ascii_case("COUNT") => Some(count_arg(parse)?),
            Some(_) => return Err(CommandError::Syntax),
            None => None,
        };

        Ok(XRange {
            key,
            start,
            end,
            count,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let entries = db.xrange(&self.key, self.start, self.end, self.count)?;

        Ok(entries_frame(entries))
    }
}

impl XRead {
    /// `XREAD [COUNT n] [BLOCK ms] STREAMS key [key ...] id [id ...]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<XRead, CommandError> {
        let mut count = None;
        let mut block = None;

        loop {
            let option = parse.next_string()?.to_uppercase();

            match option.as_str() {
                "COUNT" => count = Some(count_arg(parse)?),
                "BLOCK" => {
                    let ms = parse.next_int()?;
                    if ms < 0 {
                        return Err(CommandError::NegativeTimeout);
                    }
                    block = Some(ms as u64);
                }
                "STREAMS" => break,
                _ => return Err(CommandError::Syntax),
            }
        }

        let mut args = vec![];
        while let Some(arg) = parse.try_next_string()? {
            args.push(arg);
        }
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(CommandError::UnbalancedStreams);
        }

        let ids = args.split_off(args.len() / 2);
        let streams = args
            .into_iter()
            .zip(ids)
            .map(|(key, id)| {
                let from = match id.as_str() {
                    "$" => ReadFrom::Latest,
                    id => ReadFrom::After(StreamId::parse(id, 0)?),
                };
                Ok((key, from))
            })
            .collect::<Result<_, CommandError>>()?;

        Ok(XRead {
            count,
            block,
            streams,
        })
    }

    pub(crate) fn blocks(&self) -> bool {
        self.block.is_some()
    }

    /// Single non-blocking read. `$` reads nothing since it starts at the top.
    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let mut streams = Vec::with_capacity(self.streams.len());
        for (key, from) in self.streams {
            let after = match from {
                ReadFrom::After(id) => id,
                ReadFrom::Latest => db.stream_last_id(&key)?,
            };
            streams.push((key, after));
        }

        Ok(read(db, &streams, self.count)?.unwrap_or(Frame::NullArray))
    }

    /// Waits until any of the streams has entries past its start ID.
    pub(crate) async fn apply_blocking(self, state: &ServerState) -> Outcome {
        let db = &state.db;

        // `$` is pinned to the top entry as of now, not as of each retry.
        let mut streams = Vec::with_capacity(self.streams.len());
        for (key, from) in self.streams {
            let after = match from {
                ReadFrom::After(id) => id,
                ReadFrom::Latest => match db.stream_last_id(&key) {
                    Ok(id) => id,
                    Err(err) => return Outcome::error(err.into()),
                },
            };
            streams.push((key, after));
        }

        let timeout = Duration::from_millis(self.block.unwrap_or(0));
        let count = self.count;

        let found = block_until(state, deadline_after(timeout), || {
            match read(db, &streams, count) {
                Ok(Some(frame)) => Some(Outcome::reply(frame)),
                Ok(None) => None,
                Err(err) => Some(Outcome::error(err)),
            }
        })
        .await;

        found.unwrap_or_else(|| Outcome::reply(Frame::NullArray))
    }
}

/// `[[key, entries], ...]` for the streams that had something, `None` when
/// none did.
fn read(
    db: &Db,
    streams: &[(String, StreamId)],
    count: Option<usize>,
) -> Result<Option<Frame>, CommandError> {
    let mut frame = Frame::array();

    for (key, after) in streams {
        let entries = db.xread_after(key, *after, count)?;
        if entries.is_empty() {
            continue;
        }

        frame.push_frame(Frame::Array(vec![
            Frame::bulk(key.clone()),
            entries_frame(entries),
        ]));
    }

    match &frame {
        Frame::Array(found) if found.is_empty() => Ok(None),
        _ => Ok(Some(frame)),
    }
}

fn entries_frame(entries: Vec<StreamEntry>) -> Frame {
    Frame::Array(
        entries
            .into_iter()
            .map(|(id, fields)| {
                let flat = fields.into_iter().flat_map(|(field, value)| [field, value]);
                Frame::Array(vec![Frame::bulk(id.to_string()), Frame::command(flat)])
            })
            .collect(),
    )
}

fn count_arg(parse: &mut Parse) -> Result<usize, CommandError> {
    let count = parse.next_int()?;
    if count < 0 {
        return Err(CommandError::Syntax);
    }

    Ok(count as usize)
}
