use std::io;

use thiserror::Error;

use crate::frame;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed wire input. Terminates the owning connection.
    #[error("protocol error; {0}")]
    Protocol(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Fatal to the replica link task; there is no automatic reconnect.
    #[error("replication handshake failed: {0}")]
    Handshake(String),

    /// A write to replica `{0}` failed. The replica is dropped from the registry.
    #[error("replica {0} stopped accepting writes")]
    ReplicaWrite(u64),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<frame::Error> for Error {
    fn from(src: frame::Error) -> Error {
        match src {
            frame::Error::Incomplete => Error::Protocol("stream ended early".into()),
            frame::Error::Protocol(msg) => Error::Protocol(msg),
        }
    }
}
