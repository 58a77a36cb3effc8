use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use resp_kv::config::{self, Config};
use resp_kv::replication::{replica, Role};
use resp_kv::state::ServerState;
use resp_kv::{rdb, server, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "run_server", version, about = "RESP-compatible key-value server")]
struct Cli {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the snapshot file.
    #[arg(long)]
    dir: Option<String>,

    /// Snapshot file name inside `--dir`.
    #[arg(long)]
    dbfilename: Option<String>,

    /// Follow a master, given as "<host> <port>" or "<host>:<port>".
    #[arg(long, value_name = "MASTER")]
    replicaof: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn parse_master(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.trim().split_once(' ') {
        Some(parts) => parts,
        None => match addr.trim().rsplit_once(':') {
            Some(parts) => parts,
            None => bail!("expected \"<host> <port>\", got {addr:?}"),
        },
    };

    let port = port
        .trim()
        .parse()
        .with_context(|| format!("invalid master port in {addr:?}"))?;

    Ok((host.trim().to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let config = Config::new();
    config.set("port", cli.port.to_string());
    if let Some(dir) = &cli.dir {
        config.set(config::DIR, dir.clone());
    }
    if let Some(dbfilename) = &cli.dbfilename {
        config.set(config::DB_FILENAME, dbfilename.clone());
    }

    let role = match &cli.replicaof {
        Some(addr) => {
            let (host, port) = parse_master(addr)?;
            Role::Replica { host, port }
        }
        None => Role::Master,
    };

    let state = ServerState::new(config, role.clone());

    if let Some(path) = state.config.configured_snapshot_path() {
        let snapshot = rdb::load_file(&path)
            .await
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        if let Some(snapshot) = snapshot {
            state.db.replace_all(snapshot.into_entries());
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", cli.port)).await?;
    info!(port = cli.port, role = %role, "listening");

    if let Role::Replica { host, port } = role {
        let state = state.clone();
        let listening_port = cli.port;

        tokio::spawn(async move {
            if let Err(err) = replica::run(state, &host, port, listening_port).await {
                error!(cause = %err, "replication link failed");
            }
        });
    }

    server::run(listener, state, signal::ctrl_c()).await;

    Ok(())
}
