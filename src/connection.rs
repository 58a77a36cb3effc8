use std::io::{self, Cursor};
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::frame::{self, Frame, SEPARATOR};
use crate::Error;

/// Framed connection: buffers inbound bytes until a whole frame is available
/// and batches outbound writes behind a `BufWriter`.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().peer_addr()
    }

    /// Reads a single frame. `None` means the peer closed the connection
    /// cleanly, on a frame boundary.
    ///
    /// Cancel safe: bytes read before cancellation stay in the buffer.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        Ok(self.read_frame_sized().await?.map(|(frame, _)| frame))
    }

    /// Like [`Connection::read_frame`], also returning how many bytes of the
    /// stream the frame occupied.
    pub async fn read_frame_sized(&mut self) -> Result<Option<(Frame, usize)>, Error> {
        loop {
            if let Some(parsed) = self.parse_frame()? {
                return Ok(Some(parsed));
            }

            if !self.fill_buffer().await? {
                return Ok(None);
            }
        }
    }

    /// Reads the snapshot block a master sends after `FULLRESYNC`:
    /// `$<len>\r\n` followed by exactly `len` bytes, with no trailing separator.
    pub async fn read_snapshot_block(&mut self) -> Result<Bytes, Error> {
        loop {
            if let Some(block) = self.parse_snapshot_block()? {
                return Ok(block);
            }

            if !self.fill_buffer().await? {
                return Err(Error::ConnectionReset);
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        self.write_raw(&buf).await
    }

    /// Writes pre-encoded bytes, e.g. a replicated command stream chunk.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn write_snapshot_block(&mut self, snapshot: &[u8]) -> io::Result<()> {
        self.stream.write_all(b"$").await?;
        self.stream
            .write_all(snapshot.len().to_string().as_bytes())
            .await?;
        self.stream.write_all(SEPARATOR).await?;
        self.stream.write_all(snapshot).await?;
        self.stream.flush().await
    }

    /// Returns `false` once the peer has closed the stream with nothing left
    /// over in the buffer.
    async fn fill_buffer(&mut self) -> Result<bool, Error> {
        if 0 == self.stream.read_buf(&mut self.buffer).await? {
            if self.buffer.is_empty() {
                return Ok(false);
            }
            return Err(Error::ConnectionReset);
        }

        Ok(true)
    }

    fn parse_frame(&mut self) -> Result<Option<(Frame, usize)>, Error> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;

                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                self.buffer.advance(len);

                Ok(Some((frame, len)))
            }
            Err(Incomplete) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn parse_snapshot_block(&mut self) -> Result<Option<Bytes>, Error> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer[0] != b'$' {
            return Err(Error::Protocol(format!(
                "expected snapshot block, got type byte `{}`",
                self.buffer[0] as char
            )));
        }

        let header_end = match self
            .buffer
            .windows(SEPARATOR.len())
            .position(|window| window == SEPARATOR)
        {
            Some(end) => end,
            None => return Ok(None),
        };

        let len = std::str::from_utf8(&self.buffer[1..header_end])
            .ok()
            .and_then(|text| text.parse::<usize>().ok())
            .ok_or_else(|| Error::Protocol("invalid snapshot block length".into()))?;

        let start = header_end + SEPARATOR.len();
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::Protocol("snapshot block length out of range".into()))?;
        if self.buffer.len() < end {
            return Ok(None);
        }

        self.buffer.advance(start);

        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        (Connection::new(socket), peer)
    }

    #[tokio::test]
    async fn snapshot_block_is_read_whole() {
        let (mut conn, mut peer) = pair().await;
        peer.write_all(b"$5\r\nREDIS").await.unwrap();

        assert_eq!(conn.read_snapshot_block().await.unwrap(), Bytes::from("REDIS"));
    }

    #[tokio::test]
    async fn oversized_snapshot_length_is_rejected() {
        let (mut conn, mut peer) = pair().await;
        peer.write_all(b"$18446744073709551615\r\nxx").await.unwrap();

        assert!(matches!(conn.read_snapshot_block().await, Err(Error::Protocol(_))));
    }
}
