//! Replica side of replication: handshake with the master, load the snapshot
//! it sends, then apply its command stream.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::client::Client;
use crate::cmd::{self, Origin, Psync, ReplConf, Session};
use crate::connection::Connection;
use crate::frame::Frame;
use crate::rdb::Snapshot;
use crate::state::ServerState;
use crate::{Error, Result};

/// Connects to `host:port`, resyncs and follows the master until either side
/// shuts down. `listening_port` is what the master is told this server
/// listens on.
pub async fn run(state: ServerState, host: &str, port: u16, listening_port: u16) -> Result<()> {
    let mut client = Client::connect((host, port)).await?;
    info!(%host, port, "connected to master");

    let offset = handshake(&mut client, listening_port).await?;

    let mut connection = client.into_connection();
    let block = connection.read_snapshot_block().await?;
    let snapshot = Snapshot::decode(&block)?;
    let entries = snapshot.into_entries();

    info!(keys = entries.len(), bytes = block.len(), offset, "snapshot loaded from master");
    state.replication.set_replica_offset(offset);
    state.db.replace_all(entries);

    follow(&mut connection, &state, offset).await
}

/// The four-step handshake. Returns the offset from the FULLRESYNC reply.
pub async fn handshake(client: &mut Client, listening_port: u16) -> Result<u64> {
    expect(client.ping(None).await?, "PONG")?;
    debug!("handshake: PING answered");

    let port = listening_port.to_string();
    let reply = client
        .request(ReplConf::new("listening-port", &[port.as_str()]).into_frame())
        .await?;
    expect(reply, "OK")?;

    let reply = client
        .request(ReplConf::new("capa", &["psync2"]).into_frame())
        .await?;
    expect(reply, "OK")?;
    debug!("handshake: REPLCONF accepted");

    match client.request(Psync::new("?", -1).into_frame()).await? {
        Frame::Simple(line) => parse_fullresync(&line),
        frame => Err(Error::Handshake(format!("unexpected PSYNC reply {frame}"))),
    }
}

fn expect(reply: Frame, want: &str) -> Result<()> {
    match reply {
        Frame::Simple(got) if got.eq_ignore_ascii_case(want) => Ok(()),
        frame => Err(Error::Handshake(format!("expected {want}, got {frame}"))),
    }
}

/// `FULLRESYNC <replid> <offset>`, exactly three tokens.
fn parse_fullresync(line: &str) -> Result<u64> {
    let invalid = || Error::Handshake(format!("malformed PSYNC reply `{line}`"));

    let tokens: Vec<&str> = line.split(' ').collect();
    match tokens.as_slice() {
        ["FULLRESYNC", replid, offset] if !replid.is_empty() => {
            offset.parse::<u64>().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// Applies every command the master sends. Replies are dropped, except what a
/// command addresses to the master (GETACK answers). The offset advances by
/// each command's encoded length once it has been applied.
async fn follow(connection: &mut Connection, state: &ServerState, mut offset: u64) -> Result<()> {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut session = Session::new(state.pubsub.next_id(), tx);

    loop {
        let maybe_frame = tokio::select! {
            res = connection.read_frame_sized() => res?,
            _ = state.shutdown.cancelled() => return Ok(()),
        };

        let (frame, len) = match maybe_frame {
            Some(parsed) => parsed,
            None => {
                info!("master closed the replication link");
                return Ok(());
            }
        };

        session.set_origin(Origin::Master { offset });
        let outcome = cmd::dispatch(frame, &mut session, state).await;

        if let Some(reply) = outcome.to_master {
            connection.write_frame(&reply).await?;
        }

        offset += len as u64;
        state.replication.set_replica_offset(offset);
    }
}
