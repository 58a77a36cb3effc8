use bytes::Bytes;
use tokio::time::Duration;
use tracing::debug;

use crate::frame::Frame;
use crate::state::ServerState;

use super::parse::Parse;
use super::{deadline_after, CommandError, Origin, Outcome, Session};

/// `REPLCONF <option> [args ...]`, exchanged during and after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplConf {
    option: String,
    args: Vec<String>,
}

/// `PSYNC <replid> <offset>`. Every request is answered with a full resync,
/// so the arguments are only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct Psync {
    replid: String,
    offset: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wait {
    replicas: usize,
    timeout: Duration,
}

impl ReplConf {
    pub fn new(option: impl ToString, args: &[&str]) -> ReplConf {
        ReplConf {
            option: option.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let parts = [String::from("REPLCONF"), self.option]
            .into_iter()
            .chain(self.args)
            .map(Bytes::from);

        Frame::command(parts)
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<ReplConf, CommandError> {
        let option = parse.next_string()?;

        let mut args = vec![];
        while let Some(arg) = parse.try_next_string()? {
            args.push(arg);
        }

        Ok(ReplConf { option, args })
    }

    /// GETACK is only answered on a master link, and the answer goes back to
    /// the master rather than into the reply stream.
    pub(crate) fn apply(self, session: &Session) -> Outcome {
        match self.option.to_lowercase().as_str() {
            "listening-port" | "capa" => Outcome::reply(Frame::ok()),
            "getack" => match session.origin() {
                Origin::Master { offset } => {
                    let offset = offset.to_string();
                    Outcome {
                        to_master: Some(ReplConf::new("ACK", &[offset.as_str()]).into_frame()),
                        ..Outcome::default()
                    }
                }
                Origin::Client => Outcome::none(),
            },
            "ack" => Outcome::none(),
            other => Outcome::error(CommandError::Invalid(format!(
                "Unrecognized REPLCONF option: {other}"
            ))),
        }
    }
}

impl Psync {
    pub fn new(replid: impl ToString, offset: i64) -> Psync {
        Psync {
            replid: replid.to_string(),
            offset: offset.to_string(),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::command([Bytes::from("PSYNC"), Bytes::from(self.replid), Bytes::from(self.offset)])
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Psync, CommandError> {
        Ok(Psync {
            replid: parse.next_string()?,
            offset: parse.next_string()?,
        })
    }

    /// The connection handler takes over once `promote` is set; the
    /// FULLRESYNC line and the snapshot are written from there.
    pub(crate) fn apply(self, state: &ServerState) -> Outcome {
        if !state.replication.is_master() {
            return Outcome::error(CommandError::NotMaster);
        }

        debug!(replid = %self.replid, offset = %self.offset, "PSYNC requested");

        Outcome {
            promote: true,
            ..Outcome::default()
        }
    }
}

impl Wait {
    /// `WAIT numreplicas timeout`, the timeout in milliseconds.
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Wait, CommandError> {
        let replicas = parse.next_int()?;
        let timeout = parse.next_int()?;

        if replicas < 0 {
            return Err(CommandError::Invalid("value is out of range, must be positive".into()));
        }
        if timeout < 0 {
            return Err(CommandError::NegativeTimeout);
        }

        Ok(Wait {
            replicas: replicas as usize,
            timeout: Duration::from_millis(timeout as u64),
        })
    }

    pub(crate) async fn apply(self, state: &ServerState) -> Outcome {
        let acked = state
            .replication
            .wait(self.replicas, deadline_after(self.timeout), &state.shutdown)
            .await;

        Outcome::reply(Frame::Integer(acked as i64))
    }

    /// What WAIT reports without waiting, as inside a transaction.
    pub(crate) fn apply_now(self, state: &ServerState) -> Frame {
        let replication = &state.replication;

        let count = match replication.offset() {
            0 => replication.replica_count(),
            offset => replication.acked_count(offset),
        };

        Frame::Integer(count as i64)
    }
}
