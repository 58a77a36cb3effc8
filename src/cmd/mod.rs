//! Command parsing and the per-connection dispatcher.
//!
//! [`dispatch`] takes one decoded command array and produces an [`Outcome`]:
//! the replies for the client, the bytes to forward to replicas, anything that
//! must go back to a master, and whether the connection changes role or
//! closes. Per-connection protocol state lives in [`Session`].

use bytes::Bytes;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::db::StoreError;
use crate::frame::Frame;
use crate::replication::until;
use crate::state::ServerState;

mod list;
mod parse;
mod pubsub;
mod replication;
mod server;
mod session;
mod sorted_set;
mod stream;
mod string;

pub use list::{BLPop, LLen, LPop, LRange, Push};
pub use pubsub::{PSubscribe, PUnsubscribe, Publish, Subscribe, Unsubscribe};
pub use replication::{Psync, ReplConf, Wait};
pub use server::{Config, Echo, Info, Keys, Ping, Type};
pub use session::{Mode, Origin, Session};
pub use sorted_set::{GeoAdd, GeoPos, ZAdd, ZCard, ZRange, ZRank, ZRem, ZScore};
pub use stream::{XAdd, XRange, XRead};
pub use string::{Get, Incr, Set};

use parse::{Parse, ParseError};

/// Commands accepted while a connection is in subscribe mode.
const SUBSCRIBE_MODE_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
    "RESET",
];

/// User-facing command failure. `Display` is the exact error reply text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR unknown subcommand '{1}'. Try {0} HELP.")]
    UnknownSubcommand(String, String),

    #[error("ERR Can't execute '{0}' in subscribe mode; only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT / RESET are allowed")]
    SubscribeMode(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR timeout is not a float or out of range")]
    InvalidTimeout,

    #[error("ERR timeout is negative")]
    NegativeTimeout,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("ERR {0} is not allowed inside a transaction")]
    NotInTransaction(String),

    #[error("ERR unknown section for 'INFO' command")]
    UnknownInfoSection,

    #[error("ERR invalid longitude,latitude pair {0:.6},{1:.6}")]
    InvalidCoordinates(f64, f64),

    #[error("ERR Unbalanced 'xread' list of streams: for each stream key an ID or '$' must be specified.")]
    UnbalancedStreams,

    #[error("ERR PSYNC is only served by a master")]
    NotMaster,

    #[error("ERR snapshot save failed: {0}")]
    Save(String),

    #[error("ERR {0}")]
    Invalid(String),

    /// Ran out of arguments; reported as a wrong-arity error for the command.
    #[error("ERR missing argument")]
    MissingArgument,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ParseError> for CommandError {
    fn from(src: ParseError) -> CommandError {
        match src {
            ParseError::EndOfStream => CommandError::MissingArgument,
            ParseError::Other(msg) if msg == "syntax error" => CommandError::Syntax,
            ParseError::Other(msg) => CommandError::Invalid(msg),
        }
    }
}

/// What handling one command produced.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// Frames for the client, in order. Empty when nothing is sent back.
    pub replies: Vec<Frame>,
    /// Bytes forwarded to replicas.
    pub replicate: Option<Bytes>,
    /// Frame the replica link sends back to its master.
    pub to_master: Option<Frame>,
    /// The connection becomes a replica stream (PSYNC).
    pub promote: bool,
    /// Close after writing the replies (QUIT).
    pub close: bool,
}

impl Outcome {
    pub fn reply(frame: Frame) -> Outcome {
        Outcome {
            replies: vec![frame],
            ..Outcome::default()
        }
    }

    pub fn replies(frames: Vec<Frame>) -> Outcome {
        Outcome {
            replies: frames,
            ..Outcome::default()
        }
    }

    pub fn error(err: CommandError) -> Outcome {
        Outcome::reply(Frame::Error(err.to_string()))
    }

    pub fn none() -> Outcome {
        Outcome::default()
    }

    fn from_result(result: Result<Frame, CommandError>) -> Outcome {
        match result {
            Ok(frame) => Outcome::reply(frame),
            Err(err) => Outcome::error(err),
        }
    }

    /// Attaches `frame`'s encoding as the replication payload, unless the
    /// command failed or this session does not forward.
    fn forwarding(mut self, frame: &Frame, forwards: bool) -> Outcome {
        let failed = matches!(self.replies.first(), Some(Frame::Error(_)));
        if forwards && !failed {
            self.replicate = Some(frame.to_bytes());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Quit,
    Reset,
    Get(Get),
    Set(Set),
    Incr(Incr),
    Type(Type),
    Keys(Keys),
    Config(Config),
    Save,
    Info(Info),
    Multi,
    Exec,
    Discard,
    Push(Push),
    LPop(LPop),
    BLPop(BLPop),
    LRange(LRange),
    LLen(LLen),
    XAdd(XAdd),
    XRange(XRange),
    XRead(XRead),
    ZAdd(ZAdd),
    ZRank(ZRank),
    ZRange(ZRange),
    ZCard(ZCard),
    ZScore(ZScore),
    ZRem(ZRem),
    GeoAdd(GeoAdd),
    GeoPos(GeoPos),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    PSubscribe(PSubscribe),
    PUnsubscribe(PUnsubscribe),
    Publish(Publish),
    ReplConf(ReplConf),
    Psync(Psync),
    Wait(Wait),
}

/// Argument counts, not counting the command name.
#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    Between(usize, usize),
    AtLeast(usize),
}

impl Arity {
    fn of(name: &str) -> Option<Arity> {
        use Arity::*;

        let arity = match name {
            "PING" => Between(0, 1),
            "ECHO" => Exact(1),
            "QUIT" | "RESET" | "SAVE" | "MULTI" | "EXEC" | "DISCARD" => Exact(0),
            "GET" | "INCR" | "TYPE" | "KEYS" | "LLEN" | "ZCARD" => Exact(1),
            "SET" => AtLeast(2),
            "CONFIG" => AtLeast(1),
            "INFO" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" => AtLeast(0),
            "RPUSH" | "LPUSH" | "BLPOP" | "ZREM" => AtLeast(2),
            "LPOP" => Between(1, 2),
            "LRANGE" => Exact(3),
            "XADD" => AtLeast(4),
            "XRANGE" | "XREAD" | "ZADD" | "ZRANGE" => AtLeast(3),
            "ZRANK" | "ZSCORE" | "PUBLISH" | "PSYNC" | "WAIT" => Exact(2),
            "GEOADD" => AtLeast(4),
            "GEOPOS" | "SUBSCRIBE" | "PSUBSCRIBE" | "REPLCONF" => AtLeast(1),
            _ => return None,
        };

        Some(arity)
    }

    fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(want) => n == want,
            Arity::Between(min, max) => (min..=max).contains(&n),
            Arity::AtLeast(min) => n >= min,
        }
    }
}

/// Upper-cased command name of a command array, if it has one.
fn command_name(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Array(parts) => match parts.first() {
            Some(Frame::Bulk(bytes)) => Some(String::from_utf8_lossy(bytes).to_uppercase()),
            Some(Frame::Simple(text)) => Some(text.to_uppercase()),
            _ => None,
        },
        _ => None,
    }
}

impl Command {
    /// Parses a command array. Unknown names, wrong arity and malformed
    /// arguments are reported here, before anything is queued or run.
    pub fn from_frame(frame: Frame) -> Result<Command, CommandError> {
        let name = command_name(&frame)
            .ok_or_else(|| CommandError::Invalid("expected a command array".into()))?;

        let mut parse = Parse::new(frame)?;
        parse.next_string()?;

        let arity = Arity::of(&name).ok_or_else(|| CommandError::Unknown(name.to_lowercase()))?;
        if !arity.accepts(parse.remaining()) {
            return Err(CommandError::WrongArity(name));
        }

        Command::parse_named(&name, &mut parse).map_err(|err| match err {
            CommandError::MissingArgument => CommandError::WrongArity(name.clone()),
            err => err,
        })
    }

    fn parse_named(name: &str, parse: &mut Parse) -> Result<Command, CommandError> {
        let command = match name {
            "PING" => Command::Ping(Ping::parse_frames(parse)?),
            "ECHO" => Command::Echo(Echo::parse_frames(parse)?),
            "QUIT" => Command::Quit,
            "RESET" => Command::Reset,
            "GET" => Command::Get(Get::parse_frames(parse)?),
            "SET" => Command::Set(Set::parse_frames(parse)?),
            "INCR" => Command::Incr(Incr::parse_frames(parse)?),
            "TYPE" => Command::Type(Type::parse_frames(parse)?),
            "KEYS" => Command::Keys(Keys::parse_frames(parse)?),
            "CONFIG" => Command::Config(Config::parse_frames(parse)?),
            "SAVE" => Command::Save,
            "INFO" => Command::Info(Info::parse_frames(parse)?),
            "MULTI" => Command::Multi,
            "EXEC" => Command::Exec,
            "DISCARD" => Command::Discard,
            "RPUSH" => Command::Push(Push::parse_frames(parse, false)?),
            "LPUSH" => Command::Push(Push::parse_frames(parse, true)?),
            "LPOP" => Command::LPop(LPop::parse_frames(parse)?),
            "BLPOP" => Command::BLPop(BLPop::parse_frames(parse)?),
            "LRANGE" => Command::LRange(LRange::parse_frames(parse)?),
            "LLEN" => Command::LLen(LLen::parse_frames(parse)?),
            "XADD" => Command::XAdd(XAdd::parse_frames(parse)?),
            "XRANGE" => Command::XRange(XRange::parse_frames(parse)?),
            "XREAD" => Command::XRead(XRead::parse_frames(parse)?),
            "ZADD" => Command::ZAdd(ZAdd::parse_frames(parse)?),
            "ZRANK" => Command::ZRank(ZRank::parse_frames(parse)?),
            "ZRANGE" => Command::ZRange(ZRange::parse_frames(parse)?),
            "ZCARD" => Command::ZCard(ZCard::parse_frames(parse)?),
            "ZSCORE" => Command::ZScore(ZScore::parse_frames(parse)?),
            "ZREM" => Command::ZRem(ZRem::parse_frames(parse)?),
            "GEOADD" => Command::GeoAdd(GeoAdd::parse_frames(parse)?),
            "GEOPOS" => Command::GeoPos(GeoPos::parse_frames(parse)?),
            "SUBSCRIBE" => Command::Subscribe(Subscribe::parse_frames(parse)?),
            "UNSUBSCRIBE" => Command::Unsubscribe(Unsubscribe::parse_frames(parse)?),
            "PSUBSCRIBE" => Command::PSubscribe(PSubscribe::parse_frames(parse)?),
            "PUNSUBSCRIBE" => Command::PUnsubscribe(PUnsubscribe::parse_frames(parse)?),
            "PUBLISH" => Command::Publish(Publish::parse_frames(parse)?),
            "REPLCONF" => Command::ReplConf(ReplConf::parse_frames(parse)?),
            "PSYNC" => Command::Psync(Psync::parse_frames(parse)?),
            "WAIT" => Command::Wait(Wait::parse_frames(parse)?),
            _ => return Err(CommandError::Unknown(name.to_lowercase())),
        };

        parse.finish()?;

        Ok(command)
    }

    /// Whether a successful run changes the keyspace and must reach replicas.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set(_)
                | Command::Incr(_)
                | Command::Push(_)
                | Command::LPop(_)
                | Command::XAdd(_)
                | Command::ZAdd(_)
                | Command::ZRem(_)
                | Command::GeoAdd(_)
        )
    }
}

/// Handles one command frame for a connection.
///
/// Blocking commands suspend here without holding any lock. Everything else
/// runs to completion under the write-order lock, together with forwarding
/// its replication payload.
pub async fn dispatch(frame: Frame, session: &mut Session, state: &ServerState) -> Outcome {
    if session.mode() == Mode::Subscribed {
        let name = command_name(&frame).unwrap_or_default();
        if !SUBSCRIBE_MODE_COMMANDS.contains(&name.as_str()) {
            return Outcome::error(CommandError::SubscribeMode(name));
        }
    }

    let command = match Command::from_frame(frame.clone()) {
        Ok(command) => command,
        Err(err) => return Outcome::error(err),
    };

    if session.mode() == Mode::Queuing && !matches!(command, Command::Exec | Command::Discard) {
        session.queue(command, frame);
        return Outcome::reply(Frame::simple("QUEUED"));
    }

    match command {
        Command::BLPop(cmd) => cmd.apply_blocking(session, state).await,
        Command::XRead(cmd) if cmd.blocks() => cmd.apply_blocking(state).await,
        Command::Wait(cmd) => cmd.apply(state).await,
        command => state.ordered(|| {
            let outcome = execute(command, &frame, session, state);
            if let Some(payload) = &outcome.replicate {
                state.replication.forward(payload.clone());
            }
            outcome
        }),
    }
}

/// Runs a command to completion without suspending. Blocking commands make a
/// single attempt. The caller holds the write-order lock and forwards
/// `replicate`.
fn execute(command: Command, frame: &Frame, session: &mut Session, state: &ServerState) -> Outcome {
    let forwards = session.forwards_writes(state) && command.is_write();
    let db = &state.db;

    match command {
        Command::Ping(cmd) => Outcome::reply(cmd.apply(session)),
        Command::Echo(cmd) => Outcome::reply(cmd.apply()),
        Command::Quit => Outcome {
            replies: vec![Frame::ok()],
            close: true,
            ..Outcome::default()
        },
        Command::Reset => {
            session.reset(state);
            Outcome::reply(Frame::simple("RESET"))
        }
        Command::Get(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::Set(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::Incr(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::Type(cmd) => Outcome::reply(cmd.apply(db)),
        Command::Keys(cmd) => Outcome::reply(cmd.apply(db)),
        Command::Config(cmd) => Outcome::from_result(cmd.apply(&state.config)),
        Command::Save => Outcome::from_result(server::save(state)),
        Command::Info(cmd) => Outcome::from_result(cmd.apply(state)),
        Command::Multi => {
            session.begin();
            Outcome::reply(Frame::ok())
        }
        Command::Exec => exec(session, state),
        Command::Discard => {
            if session.discard() {
                Outcome::reply(Frame::ok())
            } else {
                Outcome::error(CommandError::DiscardWithoutMulti)
            }
        }
        Command::Push(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::LPop(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::BLPop(cmd) => cmd
            .try_pop(session.forwards_writes(state), db)
            .unwrap_or_else(|| Outcome::reply(Frame::NullArray)),
        Command::LRange(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::LLen(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::XAdd(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::XRange(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::XRead(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::ZAdd(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::ZRank(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::ZRange(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::ZCard(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::ZScore(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::ZRem(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::GeoAdd(cmd) => Outcome::from_result(cmd.apply(db)).forwarding(frame, forwards),
        Command::GeoPos(cmd) => Outcome::from_result(cmd.apply(db)),
        Command::Subscribe(cmd) => Outcome::replies(cmd.apply(session, state)),
        Command::Unsubscribe(cmd) => Outcome::replies(cmd.apply(session, state)),
        Command::PSubscribe(cmd) => Outcome::replies(cmd.apply(session, state)),
        Command::PUnsubscribe(cmd) => Outcome::replies(cmd.apply(session, state)),
        Command::Publish(cmd) => Outcome::reply(cmd.apply(state)),
        Command::ReplConf(cmd) => cmd.apply(session),
        Command::Psync(cmd) => cmd.apply(state),
        Command::Wait(cmd) => Outcome::reply(cmd.apply_now(state)),
    }
}

/// Replays the queued commands in order. Replies are gathered into one array
/// and replication payloads into one buffer.
fn exec(session: &mut Session, state: &ServerState) -> Outcome {
    let queued = match session.take_queued() {
        Some(queued) => queued,
        None => return Outcome::error(CommandError::ExecWithoutMulti),
    };

    let mut replies = Vec::with_capacity(queued.len());
    let mut payload = Vec::new();
    let mut to_master = None;

    for (command, frame) in queued {
        let outcome = match command {
            Command::Multi => Outcome::error(CommandError::NestedMulti),
            Command::Psync(_) => Outcome::error(CommandError::NotInTransaction("PSYNC".into())),
            command => execute(command, &frame, session, state),
        };

        if let Some(bytes) = &outcome.replicate {
            payload.extend_from_slice(bytes);
        }
        if outcome.to_master.is_some() {
            to_master = outcome.to_master;
        }

        match outcome.replies.len() {
            0 => replies.push(Frame::NullBulk),
            1 => replies.extend(outcome.replies),
            _ => replies.push(Frame::Array(outcome.replies)),
        }
    }

    Outcome {
        replies: vec![Frame::Array(replies)],
        replicate: (!payload.is_empty()).then(|| Bytes::from(payload)),
        to_master,
        ..Outcome::default()
    }
}

/// Deadline for a blocking command. A zero timeout blocks forever, and so
/// does one too far out to be represented.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Instant::now().checked_add(timeout)
    }
}

/// Retries `attempt` after every keyspace write until it yields a value, the
/// deadline passes or the server shuts down.
pub(crate) async fn block_until<T>(
    state: &ServerState,
    deadline: Option<Instant>,
    mut attempt: impl FnMut() -> Option<T>,
) -> Option<T> {
    loop {
        // Registered before the attempt so a write in between is not missed.
        let changed = state.db.changed();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if let Some(found) = attempt() {
            return Some(found);
        }

        tokio::select! {
            _ = changed => {}
            _ = until(deadline) => return None,
            _ = state.shutdown.cancelled() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config;
    use crate::replication::Role;

    fn master() -> ServerState {
        ServerState::new(config::Config::new(), Role::Master)
    }

    fn session(state: &ServerState) -> Session {
        let (tx, _) = mpsc::unbounded_channel();
        Session::new(state.pubsub.next_id(), tx)
    }

    async fn run(args: &[&str], session: &mut Session, state: &ServerState) -> Outcome {
        let frame = Frame::command(args.iter().map(|arg| Bytes::copy_from_slice(arg.as_bytes())));
        dispatch(frame, session, state).await
    }

    #[tokio::test]
    async fn ping_and_echo() {
        let state = master();
        let mut session = session(&state);

        assert_eq!(run(&["PING"], &mut session, &state).await.replies, vec![Frame::simple("PONG")]);
        assert_eq!(
            run(&["echo", "hey"], &mut session, &state).await.replies,
            vec![Frame::bulk("hey")]
        );
    }

    #[tokio::test]
    async fn wrong_arity_names_the_command_in_upper_case() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["get"], &mut session, &state).await;
        assert_eq!(
            outcome.replies,
            vec![Frame::error("ERR wrong number of arguments for 'GET' command")]
        );
    }

    #[tokio::test]
    async fn unknown_command() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["FLY"], &mut session, &state).await;
        assert_eq!(outcome.replies, vec![Frame::error("ERR unknown command 'fly'")]);
    }

    #[tokio::test]
    async fn writes_are_forwarded_verbatim() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["SET", "a", "1"], &mut session, &state).await;
        assert_eq!(outcome.replies, vec![Frame::ok()]);
        assert_eq!(
            outcome.replicate,
            Some(Bytes::from_static(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n"))
        );
        assert_eq!(state.replication.offset(), 27);

        let read = run(&["GET", "a"], &mut session, &state).await;
        assert_eq!(read.replicate, None);
    }

    #[tokio::test]
    async fn failed_writes_are_not_forwarded() {
        let state = master();
        let mut session = session(&state);
        run(&["SET", "s", "abc"], &mut session, &state).await;

        let outcome = run(&["INCR", "s"], &mut session, &state).await;
        assert_eq!(
            outcome.replies,
            vec![Frame::error("ERR value is not an integer or out of range")]
        );
        assert_eq!(outcome.replicate, None);
    }

    #[tokio::test]
    async fn exec_aggregates_replies_and_payloads() {
        let state = master();
        let mut session = session(&state);

        assert_eq!(run(&["MULTI"], &mut session, &state).await.replies, vec![Frame::ok()]);
        assert_eq!(
            run(&["SET", "a", "1"], &mut session, &state).await.replies,
            vec![Frame::simple("QUEUED")]
        );
        assert_eq!(
            run(&["SET", "b", "2"], &mut session, &state).await.replies,
            vec![Frame::simple("QUEUED")]
        );
        assert_eq!(state.db.get("a"), None);

        let outcome = run(&["EXEC"], &mut session, &state).await;
        assert_eq!(outcome.replies, vec![Frame::Array(vec![Frame::ok(), Frame::ok()])]);

        let mut expected = Frame::command(["SET", "a", "1"]).to_bytes().to_vec();
        expected.extend_from_slice(&Frame::command(["SET", "b", "2"]).to_bytes());
        assert_eq!(outcome.replicate, Some(Bytes::from(expected)));
        assert_eq!(session.mode(), Mode::Normal);
    }

    #[tokio::test]
    async fn exec_skips_reads_in_the_payload() {
        let state = master();
        let mut session = session(&state);

        run(&["MULTI"], &mut session, &state).await;
        run(&["INCR", "n"], &mut session, &state).await;
        run(&["GET", "n"], &mut session, &state).await;
        let outcome = run(&["EXEC"], &mut session, &state).await;

        assert_eq!(
            outcome.replies,
            vec![Frame::Array(vec![Frame::Integer(1), Frame::bulk("1")])]
        );
        assert_eq!(outcome.replicate, Some(Frame::command(["INCR", "n"]).to_bytes()));
    }

    #[tokio::test]
    async fn transaction_errors() {
        let state = master();
        let mut session = session(&state);

        assert_eq!(
            run(&["EXEC"], &mut session, &state).await.replies,
            vec![Frame::error("ERR EXEC without MULTI")]
        );
        assert_eq!(
            run(&["DISCARD"], &mut session, &state).await.replies,
            vec![Frame::error("ERR DISCARD without MULTI")]
        );

        run(&["MULTI"], &mut session, &state).await;
        run(&["SET", "a", "1"], &mut session, &state).await;
        assert_eq!(run(&["DISCARD"], &mut session, &state).await.replies, vec![Frame::ok()]);
        assert_eq!(state.db.get("a"), None);

        // Arity errors are reported at once and not queued.
        run(&["MULTI"], &mut session, &state).await;
        assert_eq!(
            run(&["SET", "a"], &mut session, &state).await.replies,
            vec![Frame::error("ERR wrong number of arguments for 'SET' command")]
        );
        assert_eq!(
            run(&["MULTI"], &mut session, &state).await.replies,
            vec![Frame::simple("QUEUED")]
        );
        assert_eq!(
            run(&["EXEC"], &mut session, &state).await.replies,
            vec![Frame::Array(vec![Frame::error("ERR MULTI calls can not be nested")])]
        );
    }

    #[tokio::test]
    async fn subscribe_mode_restricts_commands() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["SUBSCRIBE", "a", "b"], &mut session, &state).await;
        assert_eq!(
            outcome.replies,
            vec![
                Frame::Array(vec![Frame::bulk("subscribe"), Frame::bulk("a"), Frame::Integer(1)]),
                Frame::Array(vec![Frame::bulk("subscribe"), Frame::bulk("b"), Frame::Integer(2)]),
            ]
        );

        assert_eq!(
            run(&["GET", "a"], &mut session, &state).await.replies,
            vec![Frame::error(
                "ERR Can't execute 'GET' in subscribe mode; only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT / RESET are allowed"
            )]
        );
        assert_eq!(
            run(&["PING"], &mut session, &state).await.replies,
            vec![Frame::Array(vec![Frame::bulk("pong"), Frame::bulk("")])]
        );

        run(&["UNSUBSCRIBE"], &mut session, &state).await;
        assert_eq!(session.mode(), Mode::Subscribed);

        assert_eq!(
            run(&["RESET"], &mut session, &state).await.replies,
            vec![Frame::simple("RESET")]
        );
        assert_eq!(session.mode(), Mode::Normal);
    }

    #[tokio::test]
    async fn quit_closes() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["QUIT"], &mut session, &state).await;
        assert_eq!(outcome.replies, vec![Frame::ok()]);
        assert!(outcome.close);
    }

    #[tokio::test]
    async fn psync_promotes() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["PSYNC", "?", "-1"], &mut session, &state).await;
        assert!(outcome.promote);
        assert!(outcome.replies.is_empty());
    }

    #[tokio::test]
    async fn getack_reports_the_master_link_offset() {
        let state = ServerState::new(
            config::Config::new(),
            Role::Replica {
                host: "localhost".into(),
                port: 6379,
            },
        );
        let mut session = session(&state);
        session.set_origin(Origin::Master { offset: 37 });

        let outcome = run(&["REPLCONF", "GETACK", "*"], &mut session, &state).await;
        assert!(outcome.replies.is_empty());
        assert_eq!(outcome.to_master, Some(Frame::command(["REPLCONF", "ACK", "37"])));

        // Writes from the master are applied but never forwarded further.
        let outcome = run(&["SET", "k", "v"], &mut session, &state).await;
        assert_eq!(outcome.replicate, None);
        assert!(state.db.get("k").is_some());
    }

    #[test]
    fn deadlines() {
        assert!(deadline_after(Duration::ZERO).is_none());
        assert!(deadline_after(Duration::MAX).is_none());
        assert!(deadline_after(Duration::from_millis(10)).is_some());
    }

    #[tokio::test]
    async fn blpop_times_out_with_null_array() {
        let state = master();
        let mut session = session(&state);

        let outcome = run(&["BLPOP", "nothing", "0.05"], &mut session, &state).await;
        assert_eq!(outcome.replies, vec![Frame::NullArray]);
    }

    #[tokio::test]
    async fn blpop_wakes_on_push_and_forwards_lpop() {
        let state = master();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut session = session(&state);
                run(&["BLPOP", "jobs", "0"], &mut session, &state).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut pusher = session(&state);
        run(&["RPUSH", "jobs", "one"], &mut pusher, &state).await;

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.replies, vec![Frame::command(["jobs", "one"])]);
        assert_eq!(outcome.replicate, Some(Frame::command(["LPOP", "jobs"]).to_bytes()));
    }

    #[tokio::test]
    async fn xread_block_sees_later_entries() {
        let state = master();
        let mut writer = session(&state);
        run(&["XADD", "s", "1-1", "a", "1"], &mut writer, &state).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut session = session(&state);
                run(&["XREAD", "BLOCK", "1000", "STREAMS", "s", "$"], &mut session, &state).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        run(&["XADD", "s", "1-2", "b", "2"], &mut writer, &state).await;

        let outcome = waiter.await.unwrap();
        let expected = Frame::Array(vec![Frame::Array(vec![
            Frame::bulk("s"),
            Frame::Array(vec![Frame::Array(vec![Frame::bulk("1-2"), Frame::command(["b", "2"])])]),
        ])]);
        assert_eq!(outcome.replies, vec![expected]);
    }
}
