use bytes::Bytes;
use tracing::warn;

use crate::config;
use crate::db::Db;
use crate::frame::Frame;
use crate::info;
use crate::rdb::{self, Snapshot};
use crate::state::ServerState;

use super::parse::{Parse, ParseError};
use super::{CommandError, Mode, Session};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ping {
    msg: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    msg: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keys {
    pattern: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Config {
    Get(Vec<String>),
    Set(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    sections: Vec<String>,
}

impl Ping {
    pub fn new(msg: Option<Bytes>) -> Ping {
        Ping { msg }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("PING"));

        if let Some(msg) = self.msg {
            frame.push_bulk(msg);
        }

        frame
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Ping, CommandError> {
        match parse.next_bytes() {
            Ok(msg) => Ok(Ping::new(Some(msg))),
            Err(ParseError::EndOfStream) => Ok(Ping::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// In subscribe mode the reply is a `pong` message instead of a status.
    pub(crate) fn apply(self, session: &Session) -> Frame {
        match (session.mode(), self.msg) {
            (Mode::Subscribed, msg) => {
                Frame::command([Bytes::from("pong"), msg.unwrap_or_default()])
            }
            (_, Some(msg)) => Frame::Bulk(msg),
            (_, None) => Frame::simple("PONG"),
        }
    }
}

impl Echo {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Echo, CommandError> {
        Ok(Echo {
            msg: parse.next_bytes()?,
        })
    }

    pub(crate) fn apply(self) -> Frame {
        Frame::Bulk(self.msg)
    }
}

impl Type {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Type, CommandError> {
        Ok(Type {
            key: parse.next_string()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Frame {
        Frame::simple(db.type_of(&self.key).as_str())
    }
}

impl Keys {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Keys, CommandError> {
        Ok(Keys {
            pattern: parse.next_string()?,
        })
    }

    pub(crate) fn apply(self, db: &Db) -> Frame {
        Frame::command(db.keys(&self.pattern))
    }
}

impl Config {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Config, CommandError> {
        let sub = parse.next_string()?.to_uppercase();

        match sub.as_str() {
            "GET" => {
                let mut patterns = vec![parse.next_string()?];
                while let Some(pattern) = parse.try_next_string()? {
                    patterns.push(pattern);
                }
                Ok(Config::Get(patterns))
            }
            "SET" => {
                let mut pairs = vec![(parse.next_string()?, parse.next_string()?)];
                while let Some(name) = parse.try_next_string()? {
                    pairs.push((name, parse.next_string()?));
                }
                Ok(Config::Set(pairs))
            }
            _ => Err(CommandError::UnknownSubcommand("CONFIG".into(), sub.to_lowercase())),
        }
    }

    pub(crate) fn apply(self, config: &config::Config) -> Result<Frame, CommandError> {
        match self {
            Config::Get(patterns) => {
                let mut frame = Frame::array();
                for pattern in patterns {
                    for (name, value) in config.matching(&pattern.to_lowercase()) {
                        frame.push_bulk(Bytes::from(name));
                        frame.push_bulk(Bytes::from(value));
                    }
                }
                Ok(frame)
            }
            Config::Set(pairs) => {
                for (name, value) in pairs {
                    config.set(name.to_lowercase(), value);
                }
                Ok(Frame::ok())
            }
        }
    }
}

impl Info {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Info, CommandError> {
        let mut sections = vec![];
        while let Some(section) = parse.try_next_string()? {
            sections.push(section);
        }

        Ok(Info { sections })
    }

    pub(crate) fn apply(self, state: &ServerState) -> Result<Frame, CommandError> {
        if !self.sections.iter().all(|section| info::is_section(section)) {
            return Err(CommandError::UnknownInfoSection);
        }

        Ok(Frame::bulk(info::render(state, &self.sections)))
    }
}

/// SAVE: writes the keyspace to the configured snapshot file. Blocks the
/// caller until the file is in place.
pub(crate) fn save(state: &ServerState) -> Result<Frame, CommandError> {
    let path = state.config.snapshot_path();
    let snapshot = Snapshot::from_entries(state.db.entries());

    rdb::save_file(&path, &snapshot).map_err(|err| {
        warn!(path = %path.display(), cause = %err, "SAVE failed");
        CommandError::Save(err.to_string())
    })?;

    Ok(Frame::ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Parse {
        Parse::new(Frame::command(args.iter().map(|arg| Bytes::copy_from_slice(arg.as_bytes())))).unwrap()
    }

    #[test]
    fn config_get_and_set() {
        let config = config::Config::new();

        let set = Config::parse_frames(&mut parse(&["SET", "dir", "/tmp"])).unwrap();
        assert_eq!(set.apply(&config), Ok(Frame::ok()));

        let get = Config::parse_frames(&mut parse(&["GET", "dir"])).unwrap();
        assert_eq!(get.apply(&config), Ok(Frame::command(["dir", "/tmp"])));

        let missing = Config::parse_frames(&mut parse(&["GET", "nope"])).unwrap();
        assert_eq!(missing.apply(&config), Ok(Frame::array()));
    }

    #[test]
    fn config_unknown_subcommand() {
        assert_eq!(
            Config::parse_frames(&mut parse(&["REWRITE"])),
            Err(CommandError::UnknownSubcommand("CONFIG".into(), "rewrite".into()))
        );
    }

    #[test]
    fn ping_into_frame() {
        assert_eq!(Ping::new(None).into_frame(), Frame::command(["PING"]));
        assert_eq!(
            Ping::new(Some(Bytes::from("hi"))).into_frame(),
            Frame::command(["PING", "hi"])
        );
    }
}
