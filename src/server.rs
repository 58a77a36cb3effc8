use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::cmd::{self, Session};
use crate::connection::Connection;
use crate::frame::Frame;
use crate::replication;
use crate::state::ServerState;
use crate::{Error, Result};

#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    state: ServerState,
}

/// Per-connection task state.
#[derive(Debug)]
struct Handler {
    connection: Connection,
    peer: Option<SocketAddr>,
    session: Session,
    /// Pub/sub deliveries addressed to this connection.
    messages: UnboundedReceiver<Frame>,
    state: ServerState,
}

/// Accepts connections until `shutdown` resolves, then signals every
/// connection task to stop through the state's cancellation token.
pub async fn run(listener: TcpListener, state: ServerState, shutdown: impl Future) {
    let mut server = Listener {
        listener,
        state: state.clone(),
    };

    // select gives running tasks an opportunity to finish their execution
    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    state.shutdown.cancel();
}

impl Listener {
    /// Accepts a connection, builds a Handler for it and spawns a task to run
    /// it, then goes straight back to accepting.
    async fn run(&mut self) -> Result<()> {
        loop {
            let socket = self.accept().await?;
            let peer = socket.peer_addr().ok();

            debug!(?peer, "accepted connection");

            let (tx, messages) = mpsc::unbounded_channel();
            let session = Session::new(self.state.pubsub.next_id(), tx);

            let handler = Handler {
                connection: Connection::new(socket),
                peer,
                session,
                messages,
                state: self.state.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    warn!(?peer, cause = %err, "connection error");
                }
            });
        }
    }

    /// Transient accept errors are retried with exponential backoff; after the
    /// sixth failure in a row the error is returned.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!(cause = %err, backoff, "accept failed, retrying");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Handler {
    async fn run(mut self) -> Result<()> {
        let result = self.serve().await;

        self.session.close(&self.state);
        debug!(peer = ?self.peer, "connection closed");

        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let maybe_frame = tokio::select! {
                res = self.connection.read_frame() => res?,
                Some(message) = self.messages.recv() => {
                    self.connection.write_frame(&message).await?;
                    continue;
                }
                _ = self.state.shutdown.cancelled() => return Ok(()),
            };

            let frame = match maybe_frame {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let outcome = cmd::dispatch(frame, &mut self.session, &self.state).await;

            for reply in &outcome.replies {
                self.connection.write_frame(reply).await?;
            }

            if outcome.promote {
                info!(peer = ?self.peer, "connection promoted to replica link");
                return match replication::serve_replica(&mut self.connection, &self.state).await {
                    Err(Error::ReplicaWrite(id)) => {
                        debug!(replica = id, "replica link dropped");
                        Ok(())
                    }
                    res => res,
                };
            }

            if outcome.close {
                return Ok(());
            }
        }
    }
}
