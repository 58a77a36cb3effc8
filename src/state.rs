use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Db;
use crate::pubsub::PubSub;
use crate::replication::{Replication, Role};

/// Everything a connection task shares with the rest of the process.
/// Cloning is cheap; all clones refer to the same server.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub db: Db,
    pub config: Config,
    pub pubsub: PubSub,
    pub replication: Replication,
    pub shutdown: CancellationToken,
    /// Serialises "apply to the keyspace, then forward to replicas" so the
    /// replication stream carries writes in the order they were applied.
    write_order: Arc<Mutex<()>>,
}

impl ServerState {
    pub fn new(config: Config, role: Role) -> ServerState {
        ServerState {
            db: Db::new(),
            config,
            pubsub: PubSub::new(),
            replication: Replication::new(role),
            shutdown: CancellationToken::new(),
            write_order: Arc::new(Mutex::new(())),
        }
    }

    /// Runs `f` while holding the write-order lock. `f` must not block.
    pub fn ordered<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.write_order.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
