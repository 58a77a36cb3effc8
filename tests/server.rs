use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use resp_kv::client::Client;
use resp_kv::config::Config;
use resp_kv::frame::Frame;
use resp_kv::replication::Role;
use resp_kv::server;
use resp_kv::state::ServerState;

async fn start_server() -> (SocketAddr, ServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(Config::new(), Role::Master);

    let server_state = state.clone();
    tokio::spawn(async move { server::run(listener, server_state, std::future::pending::<()>()).await });

    (addr, state)
}

#[tokio::test]
async fn ping_pong() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.ping(None).await.unwrap(), Frame::simple("PONG"));
    assert_eq!(
        client.ping(Some(Bytes::from("hello"))).await.unwrap(),
        Frame::bulk("hello")
    );
}

#[tokio::test]
async fn key_value_get_set() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.get("hello").await.unwrap(), None);
    client.set("hello", Bytes::from("world")).await.unwrap();
    assert_eq!(client.get("hello").await.unwrap(), Some(Bytes::from("world")));
}

#[tokio::test]
async fn set_with_expiry() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.command(["SET", "temp", "x", "PX", "50"]).await.unwrap(),
        Frame::ok()
    );
    assert_eq!(client.get("temp").await.unwrap(), Some(Bytes::from("x")));

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.get("temp").await.unwrap(), None);
}

#[tokio::test]
async fn transactions_over_the_wire() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.command(["MULTI"]).await.unwrap(), Frame::ok());
    assert_eq!(client.command(["INCR", "n"]).await.unwrap(), Frame::simple("QUEUED"));
    assert_eq!(client.command(["INCR", "n"]).await.unwrap(), Frame::simple("QUEUED"));
    assert_eq!(
        client.command(["EXEC"]).await.unwrap(),
        Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)])
    );
}

#[tokio::test]
async fn blpop_served_by_another_connection() {
    let (addr, _) = start_server().await;

    let waiter = tokio::spawn(async move {
        let mut client = Client::connect(addr).await.unwrap();
        client.command(["BLPOP", "queue", "2"]).await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut pusher = Client::connect(addr).await.unwrap();
    assert_eq!(
        pusher.command(["RPUSH", "queue", "job"]).await.unwrap(),
        Frame::Integer(1)
    );

    assert_eq!(waiter.await.unwrap(), Frame::command(["queue", "job"]));
    assert_eq!(pusher.command(["LLEN", "queue"]).await.unwrap(), Frame::Integer(0));
}

#[tokio::test]
async fn unknown_command_keeps_connection_open() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.command(["NOPE"]).await.unwrap(),
        Frame::error("ERR unknown command 'nope'")
    );
    assert_eq!(client.ping(None).await.unwrap(), Frame::simple("PONG"));
}

#[tokio::test]
async fn config_and_info() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    client.command(["CONFIG", "SET", "dir", "/tmp"]).await.unwrap();
    assert_eq!(
        client.command(["CONFIG", "GET", "dir"]).await.unwrap(),
        Frame::command(["dir", "/tmp"])
    );

    let Frame::Bulk(info) = client.command(["INFO", "replication"]).await.unwrap() else {
        panic!("INFO replies with a bulk string");
    };
    let info = String::from_utf8(info.to_vec()).unwrap();
    assert!(info.starts_with("# Replication\r\n"));
    assert!(info.contains("role:master\r\n"));
}

/// Sends `bytes` on a raw socket and returns whatever the server writes back
/// before closing the connection.
async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(bytes).await.unwrap();

    let mut received = vec![];
    // A reset counts as closed too.
    let _ = timeout(Duration::from_secs(2), socket.read_to_end(&mut received))
        .await
        .expect("connection was not closed");
    received
}

#[tokio::test]
async fn protocol_error_closes_only_that_connection() {
    let (addr, _) = start_server().await;
    let mut bystander = Client::connect(addr).await.unwrap();

    assert!(send_raw(addr, b"?bad\r\n").await.is_empty());

    assert_eq!(bystander.ping(None).await.unwrap(), Frame::simple("PONG"));
    let mut fresh = Client::connect(addr).await.unwrap();
    assert_eq!(fresh.ping(None).await.unwrap(), Frame::simple("PONG"));
}

#[tokio::test]
async fn deeply_nested_frame_is_refused() {
    let (addr, _) = start_server().await;

    let mut nested = b"*1\r\n".repeat(100);
    nested.extend_from_slice(b":1\r\n");
    assert!(send_raw(addr, &nested).await.is_empty());

    let mut client = Client::connect(addr).await.unwrap();
    assert_eq!(client.ping(None).await.unwrap(), Frame::simple("PONG"));
}

#[tokio::test]
async fn blpop_with_huge_timeout_is_an_error_reply() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.command(["BLPOP", "k", "1e300"]).await.unwrap(),
        Frame::error("ERR timeout is not a float or out of range")
    );
    assert_eq!(client.ping(None).await.unwrap(), Frame::simple("PONG"));
}

#[tokio::test]
async fn blpop_times_out_on_the_wire() {
    let (addr, _) = start_server().await;
    let mut client = Client::connect(addr).await.unwrap();

    let reply = timeout(Duration::from_secs(2), client.command(["BLPOP", "empty", "0.05"]))
        .await
        .expect("BLPOP never timed out");
    assert_eq!(reply.unwrap(), Frame::NullArray);
}
