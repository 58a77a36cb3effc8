use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::cmd::{Get, Ping, Publish, Set};
use crate::connection::Connection;
use crate::frame::Frame;
use crate::{Error, Result};

/// Request/response client over a single connection. Used by the command-line
/// client and by a replica talking to its master.
#[derive(Debug)]
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);

        Ok(Client { connection })
    }

    pub async fn ping(&mut self, msg: Option<Bytes>) -> Result<Frame> {
        self.request(Ping::new(msg).into_frame()).await
    }

    /// `None` when the key is missing.
    pub async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        match self.request(Get::new(key).into_frame()).await? {
            Frame::Bulk(value) => Ok(Some(value)),
            Frame::NullBulk | Frame::Null => Ok(None),
            frame => Err(unexpected(frame)),
        }
    }

    pub async fn set(&mut self, key: &str, value: Bytes) -> Result<()> {
        match self.request(Set::new(key, value).into_frame()).await? {
            Frame::Simple(response) if response == "OK" => Ok(()),
            frame => Err(unexpected(frame)),
        }
    }

    /// Number of subscribers the message reached.
    pub async fn publish(&mut self, channel: &str, message: Bytes) -> Result<i64> {
        let frame = Publish::new(channel.to_string(), message).into_frame();

        match self.request(frame).await? {
            Frame::Integer(delivered) => Ok(delivered),
            frame => Err(unexpected(frame)),
        }
    }

    /// Sends an arbitrary command and returns the raw reply, error replies
    /// included.
    pub async fn command<I, T>(&mut self, args: I) -> Result<Frame>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.request(Frame::command(args)).await
    }

    pub async fn request(&mut self, frame: Frame) -> Result<Frame> {
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;

        self.read_response().await
    }

    /// Hands the underlying connection over, e.g. once a replica has finished
    /// its handshake and starts consuming the command stream.
    pub fn into_connection(self) -> Connection {
        self.connection
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    async fn read_response(&mut self) -> Result<Frame> {
        match self.connection.read_frame().await? {
            Some(frame) => Ok(frame),
            // The peer closed the socket before answering.
            None => Err(Error::ConnectionReset),
        }
    }
}

fn unexpected(frame: Frame) -> Error {
    match frame {
        Frame::Error(msg) => Error::Protocol(msg),
        frame => Error::Protocol(format!("unexpected reply {frame}")),
    }
}
