pub mod client;
pub mod cmd;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod frame;
pub mod glob;
pub mod info;
pub mod pubsub;
pub mod rdb;
pub mod replication;
pub mod server;
pub mod state;

pub use error::{Error, Result};

pub const DEFAULT_PORT: u16 = 6379;
