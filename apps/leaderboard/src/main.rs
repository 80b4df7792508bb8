use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use leaderboard_service::config::Config;

#[derive(Parser, Debug)]
#[command(name = "leaderboard-service")]
#[command(about = "Points ledger, leaderboard ranking and snapshot service")]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Overrides LEADERBOARD_BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    leaderboard_service::serve(config).await
}
