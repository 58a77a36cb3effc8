use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use super::{now_millis, Db, Entry, StoreError, Value};

/// Two-part stream entry ID. Ordered by milliseconds, then sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

/// The ID argument of XADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// `*`
    Auto,
    /// `<ms>-*`
    AutoSeq(u64),
    Explicit(StreamId),
}

pub type StreamEntry = (StreamId, Vec<(Bytes, Bytes)>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Vec<(Bytes, Bytes)>>,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> StreamId {
        StreamId { ms, seq }
    }

    /// Parses `<ms>-<seq>` or a bare `<ms>`, which takes `default_seq`.
    pub fn parse(text: &str, default_seq: u64) -> Result<StreamId, StoreError> {
        let (ms, seq) = match text.split_once('-') {
            Some((ms, seq)) => (ms, Some(seq)),
            None => (text, None),
        };

        let ms = ms.parse::<u64>().map_err(|_| StoreError::InvalidStreamId)?;
        let seq = match seq {
            Some(seq) => seq.parse::<u64>().map_err(|_| StoreError::InvalidStreamId)?,
            None => default_seq,
        };

        Ok(StreamId { ms, seq })
    }

    /// Parses an XRANGE bound: `-` and `+` are the extremes, a bare `<ms>`
    /// covers every sequence number of that millisecond.
    pub fn parse_bound(text: &str, is_start: bool) -> Result<StreamId, StoreError> {
        match text {
            "-" => Ok(StreamId::MIN),
            "+" => Ok(StreamId::MAX),
            _ => StreamId::parse(text, if is_start { 0 } else { u64::MAX }),
        }
    }

    fn next(&self) -> Option<StreamId> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(StreamId { ms: self.ms, seq }),
            None => self.ms.checked_add(1).map(|ms| StreamId { ms, seq: 0 }),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl IdSpec {
    pub fn parse(text: &str) -> Result<IdSpec, StoreError> {
        if text == "*" {
            return Ok(IdSpec::Auto);
        }

        match text.split_once('-') {
            Some((ms, "*")) => ms
                .parse::<u64>()
                .map(IdSpec::AutoSeq)
                .map_err(|_| StoreError::InvalidStreamId),
            _ => StreamId::parse(text, 0).map(IdSpec::Explicit),
        }
    }
}

impl Stream {
    pub fn new() -> Stream {
        Stream::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> Option<StreamId> {
        self.entries.keys().next_back().copied()
    }

    /// Resolves `requested` against the current top entry and appends.
    pub fn add(
        &mut self,
        requested: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
        now: u64,
    ) -> Result<StreamId, StoreError> {
        let top = self.last_id();

        let id = match requested {
            IdSpec::Explicit(id) => {
                if id == StreamId::MIN {
                    return Err(StoreError::StreamIdZero);
                }
                id
            }
            IdSpec::AutoSeq(ms) => match top {
                Some(top) if top.ms == ms => StreamId::new(ms, top.seq.checked_add(1).ok_or(StoreError::StreamIdTooSmall)?),
                _ => StreamId::new(ms, if ms == 0 { 1 } else { 0 }),
            },
            IdSpec::Auto => match top {
                Some(top) if top.ms >= now => top.next().ok_or(StoreError::StreamIdTooSmall)?,
                _ => StreamId::new(now, 0),
            },
        };

        if top.is_some_and(|top| id <= top) {
            return Err(StoreError::StreamIdTooSmall);
        }

        self.entries.insert(id, fields);

        Ok(id)
    }

    /// Entries with `start <= id <= end`, at most `count` of them.
    pub fn range(&self, start: StreamId, end: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        if start > end {
            return vec![];
        }

        self.entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| (*id, fields.clone()))
            .collect()
    }

    /// Entries strictly after `after`.
    pub fn after(&self, after: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        match after.next() {
            Some(start) => self.range(start, StreamId::MAX, count),
            None => vec![],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &Vec<(Bytes, Bytes)>)> {
        self.entries.iter()
    }
}

impl Db {
    pub fn xadd(
        &self,
        key: &str,
        requested: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, StoreError> {
        self.write(|state| {
            let now = now_millis();

            match state.live(key, now).map(|entry| &mut entry.value) {
                Some(Value::Stream(stream)) => stream.add(requested, fields, now),
                Some(_) => Err(StoreError::WrongType),
                None => {
                    let mut stream = Stream::new();
                    let id = stream.add(requested, fields, now)?;
                    state.insert(key.to_string(), Entry::new(Value::Stream(stream), None));
                    Ok(id)
                }
            }
        })
    }

    pub fn xrange(
        &self,
        key: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.with_stream(key, |stream| stream.range(start, end, count))
    }

    pub fn xread_after(
        &self,
        key: &str,
        after: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.with_stream(key, |stream| stream.after(after, count))
    }

    /// ID of the newest entry, `0-0` for a missing or empty stream.
    pub fn stream_last_id(&self, key: &str) -> Result<StreamId, StoreError> {
        self.with_stream(key, |stream| stream.last_id().unwrap_or(StreamId::MIN))
    }

    fn with_stream<R: Default>(
        &self,
        key: &str,
        f: impl FnOnce(&Stream) -> R,
    ) -> Result<R, StoreError> {
        match self.state().live(key, now_millis()).map(|entry| &entry.value) {
            None => Ok(R::default()),
            Some(Value::Stream(stream)) => Ok(f(stream)),
            Some(_) => Err(StoreError::WrongType),
        }
    }
}
