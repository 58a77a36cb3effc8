use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use resp_kv::client::Client;
use resp_kv::config::Config;
use resp_kv::db::Value;
use resp_kv::frame::Frame;
use resp_kv::replication::{replica, Role};
use resp_kv::server;
use resp_kv::state::ServerState;

async fn start_master() -> (SocketAddr, ServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(Config::new(), Role::Master);

    let server_state = state.clone();
    tokio::spawn(async move { server::run(listener, server_state, std::future::pending::<()>()).await });

    (addr, state)
}

fn start_replica(master: SocketAddr) -> ServerState {
    let state = ServerState::new(
        Config::new(),
        Role::Replica {
            host: master.ip().to_string(),
            port: master.port(),
        },
    );

    let link_state = state.clone();
    tokio::spawn(async move {
        replica::run(link_state, &master.ip().to_string(), master.port(), 6380)
            .await
            .unwrap();
    });

    state
}

/// Polls `check` every few milliseconds for up to two seconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn replica_loads_master_snapshot() {
    let (addr, master) = start_master().await;
    let mut client = Client::connect(addr).await.unwrap();
    client.set("x", Bytes::from("1")).await.unwrap();

    let replica = start_replica(addr);

    eventually(|| master.replication.replica_count() == 1).await;
    eventually(|| replica.db.get("x").is_some()).await;

    assert_eq!(replica.db.get("x"), Some(Value::String(Bytes::from("1"))));
    // The key came with the snapshot; the replica starts at the master's offset.
    assert_eq!(replica.replication.replica_offset(), master.replication.offset());
}

#[tokio::test]
async fn writes_stream_to_the_replica() {
    let (addr, master) = start_master().await;
    let replica = start_replica(addr);
    eventually(|| master.replication.replica_count() == 1).await;

    let mut client = Client::connect(addr).await.unwrap();
    client.set("a", Bytes::from("1")).await.unwrap();
    client.command(["RPUSH", "l", "x", "y"]).await.unwrap();
    client.command(["GET", "a"]).await.unwrap();

    eventually(|| replica.replication.replica_offset() == master.replication.offset()).await;

    assert_eq!(replica.db.get("a"), Some(Value::String(Bytes::from("1"))));
    assert_eq!(replica.db.list_len("l"), Ok(2));
}

#[tokio::test]
async fn wait_counts_acknowledging_replicas() {
    let (addr, master) = start_master().await;
    let _replica = start_replica(addr);
    eventually(|| master.replication.replica_count() == 1).await;

    let mut client = Client::connect(addr).await.unwrap();
    client.set("a", Bytes::from("1")).await.unwrap();

    assert_eq!(
        client.command(["WAIT", "1", "1000"]).await.unwrap(),
        Frame::Integer(1)
    );
}

#[tokio::test]
async fn wait_without_writes_reports_connected_replicas() {
    let (addr, master) = start_master().await;
    let _first = start_replica(addr);
    let _second = start_replica(addr);
    eventually(|| master.replication.replica_count() == 2).await;

    let mut client = Client::connect(addr).await.unwrap();
    assert_eq!(
        client.command(["WAIT", "5", "500"]).await.unwrap(),
        Frame::Integer(2)
    );
}
