//! Master-side replica registry and offset bookkeeping.
//!
//! Every write applied on the master is handed to [`Replication::forward`],
//! which advances the replication offset by the payload length and queues the
//! payload on each attached replica's channel. A per-replica task drains that
//! channel onto the socket and collects `REPLCONF ACK` replies, which feed
//! WAIT.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::frame::Frame;
use crate::rdb::Snapshot;
use crate::state::ServerState;
use crate::{Error, Result};

pub mod replica;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct Replication {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    registry: Mutex<Registry>,
    /// Signalled whenever a replica acknowledges an offset.
    acks: Notify,
    replid: String,
    role: Role,
    /// Bytes of the master's stream this process has applied, when it is a
    /// replica.
    replica_offset: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    offset: u64,
    next_id: u64,
    replicas: HashMap<u64, ReplicaHandle>,
}

#[derive(Debug)]
struct ReplicaHandle {
    tx: UnboundedSender<Bytes>,
    acked: u64,
    addr: Option<SocketAddr>,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica { .. } => write!(f, "slave"),
        }
    }
}

/// 40 random lowercase hex digits.
fn generate_replid() -> String {
    let bytes: [u8; 20] = rand::thread_rng().gen();

    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl Replication {
    pub fn new(role: Role) -> Replication {
        Replication {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                acks: Notify::new(),
                replid: generate_replid(),
                role,
                replica_offset: AtomicU64::new(0),
            }),
        }
    }

    pub fn role(&self) -> &Role {
        &self.shared.role
    }

    pub fn is_master(&self) -> bool {
        self.shared.role == Role::Master
    }

    pub fn replid(&self) -> &str {
        &self.shared.replid
    }

    /// Total bytes forwarded to replicas so far.
    pub fn offset(&self) -> u64 {
        self.registry().offset
    }

    pub fn replica_count(&self) -> usize {
        self.registry().replicas.len()
    }

    /// Addresses and acknowledged offsets of attached replicas, by id.
    pub fn replicas(&self) -> Vec<(u64, Option<SocketAddr>, u64)> {
        let registry = self.registry();
        let mut replicas: Vec<_> = registry
            .replicas
            .iter()
            .map(|(id, handle)| (*id, handle.addr, handle.acked))
            .collect();
        replicas.sort_by_key(|(id, _, _)| *id);
        replicas
    }

    pub fn replica_offset(&self) -> u64 {
        self.shared.replica_offset.load(Ordering::Acquire)
    }

    pub fn set_replica_offset(&self, offset: u64) {
        self.shared.replica_offset.store(offset, Ordering::Release);
    }

    /// Registers a replica. The returned offset is the stream position its
    /// first queued payload starts at.
    pub fn attach(&self, addr: Option<SocketAddr>) -> (u64, UnboundedReceiver<Bytes>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();

        let id = registry.next_id;
        registry.next_id += 1;
        registry.replicas.insert(id, ReplicaHandle { tx, acked: 0, addr });

        info!(replica = id, ?addr, offset = registry.offset, "replica attached");

        (id, rx, registry.offset)
    }

    pub fn detach(&self, id: u64) {
        if self.registry().replicas.remove(&id).is_some() {
            info!(replica = id, "replica detached");
            self.shared.acks.notify_waiters();
        }
    }

    /// Advances the offset by `payload.len()` and queues the payload for every
    /// replica. Replicas whose link is gone are evicted.
    pub fn forward(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let mut registry = self.registry();
        registry.offset += payload.len() as u64;

        registry.replicas.retain(|id, handle| {
            let alive = handle.tx.send(payload.clone()).is_ok();
            if !alive {
                warn!(replica = *id, "evicting replica with a closed link");
            }
            alive
        });

        debug!(offset = registry.offset, bytes = payload.len(), "forwarded");
    }

    pub fn record_ack(&self, id: u64, offset: u64) {
        if let Some(handle) = self.registry().replicas.get_mut(&id) {
            handle.acked = handle.acked.max(offset);
        }

        self.shared.acks.notify_waiters();
    }

    /// Replicas that have acknowledged at least `target`.
    pub fn acked_count(&self, target: u64) -> usize {
        self.registry()
            .replicas
            .values()
            .filter(|handle| handle.acked >= target)
            .count()
    }

    /// Waits until `needed` replicas have acknowledged everything forwarded
    /// before the call, or until `deadline`. Returns how many had.
    pub async fn wait(
        &self,
        needed: usize,
        deadline: Option<Instant>,
        shutdown: &CancellationToken,
    ) -> usize {
        let target = self.offset();

        if target == 0 {
            return self.replica_count();
        }

        let acked = self.acked_count(target);
        if acked >= needed {
            return acked;
        }

        let acks = self.shared.acks.notified();
        tokio::pin!(acks);
        acks.as_mut().enable();

        self.forward(Frame::command(["REPLCONF", "GETACK", "*"]).to_bytes());

        loop {
            let acked = self.acked_count(target);
            if acked >= needed {
                return acked;
            }

            tokio::select! {
                _ = acks.as_mut() => {
                    acks.set(self.shared.acks.notified());
                    acks.as_mut().enable();
                }
                _ = until(deadline) => return self.acked_count(target),
                _ = shutdown.cancelled() => return self.acked_count(target),
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Serves a connection that has just sent PSYNC: full resync, then the
/// command stream, until either side goes away.
pub async fn serve_replica(connection: &mut Connection, state: &ServerState) -> Result<()> {
    let addr = connection.peer_addr().ok();

    // Holding the write-order lock pins the snapshot to exactly `offset`.
    let (id, mut rx, offset, snapshot) = state.ordered(|| {
        let (id, rx, offset) = state.replication.attach(addr);
        let snapshot = Snapshot::from_entries(state.db.entries()).encode();
        (id, rx, offset, snapshot)
    });

    let result = stream_to_replica(connection, state, id, &mut rx, offset, &snapshot).await;

    state.replication.detach(id);

    result
}

async fn stream_to_replica(
    connection: &mut Connection,
    state: &ServerState,
    id: u64,
    rx: &mut UnboundedReceiver<Bytes>,
    offset: u64,
    snapshot: &[u8],
) -> Result<()> {
    let resync = Frame::simple(format!("FULLRESYNC {} {}", state.replication.replid(), offset));
    connection.write_frame(&resync).await?;
    connection.write_snapshot_block(snapshot).await?;

    debug!(replica = id, bytes = snapshot.len(), "snapshot sent");

    loop {
        tokio::select! {
            payload = rx.recv() => match payload {
                Some(payload) => {
                    if let Err(err) = connection.write_raw(&payload).await {
                        debug!(replica = id, cause = %err, "replica write failed");
                        return Err(Error::ReplicaWrite(id));
                    }
                }
                None => return Ok(()),
            },
            frame = connection.read_frame() => match frame? {
                Some(frame) => handle_replica_frame(state, id, frame),
                None => return Ok(()),
            },
            _ = state.shutdown.cancelled() => return Ok(()),
        }
    }
}

/// The only thing a replica sends back is `REPLCONF ACK <offset>`.
fn handle_replica_frame(state: &ServerState, id: u64, frame: Frame) {
    let ack = match &frame {
        Frame::Array(parts) if parts.len() == 3 => {
            let word = |at: usize| match &parts[at] {
                Frame::Bulk(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
                Frame::Simple(text) => Some(text.clone()),
                _ => None,
            };

            match (word(0), word(1), word(2)) {
                (Some(cmd), Some(sub), Some(offset))
                    if cmd.eq_ignore_ascii_case("replconf") && sub.eq_ignore_ascii_case("ack") =>
                {
                    offset.parse::<u64>().ok()
                }
                _ => None,
            }
        }
        _ => None,
    };

    match ack {
        Some(offset) => {
            debug!(replica = id, offset, "ack");
            state.replication.record_ack(id, offset);
        }
        None => warn!(replica = id, %frame, "unexpected frame from replica"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn replid_is_forty_hex_digits() {
        let replication = Replication::new(Role::Master);
        assert_eq!(replication.replid().len(), 40);
        assert!(replication.replid().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn forward_advances_offset_before_fan_out() {
        let replication = Replication::new(Role::Master);
        let (_, mut rx, start) = replication.attach(None);
        assert_eq!(start, 0);

        replication.forward(Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));

        assert_eq!(replication.offset(), 14);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"));
    }

    #[test]
    fn dead_replicas_are_evicted() {
        let replication = Replication::new(Role::Master);
        let (_, rx, _) = replication.attach(None);
        drop(rx);

        replication.forward(Bytes::from_static(b"x"));

        assert_eq!(replication.replica_count(), 0);
        assert_eq!(replication.offset(), 1);
    }

    #[tokio::test]
    async fn wait_without_writes_counts_replicas() {
        let replication = Replication::new(Role::Master);
        let _a = replication.attach(None);
        let _b = replication.attach(None);

        let count = replication.wait(5, None, &CancellationToken::new()).await;
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn wait_collects_acks() {
        let replication = Replication::new(Role::Master);
        let (id, mut rx, _) = replication.attach(None);
        replication.forward(Bytes::from_static(b"0123456789"));

        let acker = {
            let replication = replication.clone();
            tokio::spawn(async move {
                // The write, then the GETACK request.
                rx.recv().await.unwrap();
                rx.recv().await.unwrap();
                replication.record_ack(id, 10);
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let count = replication.wait(1, Some(deadline), &CancellationToken::new()).await;
        acker.await.unwrap();

        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let replication = Replication::new(Role::Master);
        let _replica = replication.attach(None);
        replication.forward(Bytes::from_static(b"abc"));

        let deadline = Instant::now() + Duration::from_millis(50);
        let count = replication.wait(1, Some(deadline), &CancellationToken::new()).await;

        assert_eq!(count, 0);
    }
}
