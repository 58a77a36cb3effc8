use bytes::Bytes;

use crate::db::{geo, Db};
use crate::frame::Frame;

use super::parse::{Parse, ParseError};
use super::CommandError;

#[derive(Debug, Clone, PartialEq)]
pub struct ZAdd {
    key: String,
    members: Vec<(f64, Bytes)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZRank {
    key: String,
    member: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZRange {
    key: String,
    start: i64,
    stop: i64,
    with_scores: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZCard {
    key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZScore {
    key: String,
    member: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZRem {
    key: String,
    members: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoAdd {
    key: String,
    /// `(longitude, latitude, member)`
    places: Vec<(f64, f64, Bytes)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoPos {
    key: String,
    members: Vec<Bytes>,
}

/// Scores are sent back in their shortest round-tripping form.
fn score_frame(score: f64) -> Frame {
    Frame::bulk(score.to_string())
}

fn rest(parse: &mut Parse) -> Result<Vec<Bytes>, CommandError> {
    let mut values = vec![];
    loop {
        match parse.next_bytes() {
            Ok(value) => values.push(value),
            Err(ParseError::EndOfStream) => return Ok(values),
            Err(err) => return Err(err.into()),
        }
    }
}

impl ZAdd {
    /// `ZADD key score member [score member ...]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZAdd, CommandError> {
        let key = parse.next_string()?;

        if parse.remaining() == 0 || parse.remaining() % 2 != 0 {
            return Err(CommandError::Syntax);
        }

        let mut members = Vec::with_capacity(parse.remaining() / 2);
        while parse.remaining() > 0 {
            members.push((parse.next_float()?, parse.next_bytes()?));
        }

        Ok(ZAdd { key, members })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.zadd(&self.key, self.members)? as i64))
    }
}

impl ZRank {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZRank, CommandError> {
        Ok(ZRank {
            key: parse.next_string()?,
            member: parse.next_bytes()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(match db.zrank(&self.key, &self.member)? {
            Some(rank) => Frame::Integer(rank as i64),
            None => Frame::NullBulk,
        })
    }
}

impl ZRange {
    /// `ZRANGE key start stop [WITHSCORES]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZRange, CommandError> {
        let key = parse.next_string()?;
        let start = parse.next_int()?;
        let stop = parse.next_int()?;

        let with_scores = match parse.try_next_string()? {
            Some(option) if option.eq_ignore_ascii_case("WITHSCORES") => true,
            Some(_) => return Err(CommandError::Syntax),
            None => false,
        };

        Ok(ZRange {
            key,
            start,
            stop,
            with_scores,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let mut frame = Frame::array();

        for (member, score) in db.zrange(&self.key, self.start, self.stop)? {
            frame.push_bulk(member);
            if self.with_scores {
                frame.push_frame(score_frame(score));
            }
        }

        Ok(frame)
    }
}

impl ZCard {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZCard, CommandError> {
        Ok(ZCard {
            key: parse.next_string()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.zcard(&self.key)? as i64))
    }
}

impl ZScore {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZScore, CommandError> {
        Ok(ZScore {
            key: parse.next_string()?,
            member: parse.next_bytes()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(match db.zscore(&self.key, &self.member)? {
            Some(score) => score_frame(score),
            None => Frame::NullBulk,
        })
    }
}

impl ZRem {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ZRem, CommandError> {
        let key = parse.next_string()?;
        let mut members = vec![parse.next_bytes()?];
        members.extend(rest(parse)?);

        Ok(ZRem { key, members })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.zrem(&self.key, &self.members)? as i64))
    }
}

impl GeoAdd {
    /// `GEOADD key longitude latitude member [longitude latitude member ...]`
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<GeoAdd, CommandError> {
        let key = parse.next_string()?;

        if parse.remaining() == 0 || parse.remaining() % 3 != 0 {
            return Err(CommandError::Syntax);
        }

        let mut places = Vec::with_capacity(parse.remaining() / 3);
        while parse.remaining() > 0 {
            let longitude = parse.next_float()?;
            let latitude = parse.next_float()?;
            let member = parse.next_bytes()?;

            if !geo::is_valid(longitude, latitude) {
                return Err(CommandError::InvalidCoordinates(longitude, latitude));
            }

            places.push((longitude, latitude, member));
        }

        Ok(GeoAdd { key, places })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        Ok(Frame::Integer(db.geoadd(&self.key, self.places)? as i64))
    }
}

impl GeoPos {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<GeoPos, CommandError> {
        let key = parse.next_string()?;
        let members = rest(parse)?;

        Ok(GeoPos { key, members })
    }

    pub(crate) fn apply(self, db: &Db) -> Result<Frame, CommandError> {
        let positions = db.geopos(&self.key, &self.members)?;

        Ok(Frame::Array(
            positions
                .into_iter()
                .map(|position| match position {
                    Some((longitude, latitude)) => {
                        Frame::command([longitude.to_string(), latitude.to_string()])
                    }
                    None => Frame::NullArray,
                })
                .collect(),
        ))
    }
}
