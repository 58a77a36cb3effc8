use anyhow::Result;
use clap::Parser;

use resp_kv::client::Client;
use resp_kv::DEFAULT_PORT;

/// Sends one command and prints the reply.
#[derive(Parser, Debug)]
#[command(name = "run_client", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Command name followed by its arguments, e.g. `SET greeting hello`.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut client = Client::connect((cli.host.as_str(), cli.port)).await?;
    let reply = client.command(cli.command).await?;

    println!("{reply}");

    Ok(())
}
