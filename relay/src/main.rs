use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use wormhole_relay::{Relay, RelayConfig};

#[derive(Debug, Parser)]
#[command(name = "wormhole-relay", about = "Rendezvous relay for wormhole clients")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,
    /// SQLite database path; omit to keep all state in memory
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Message of the day shown to every client
    #[arg(long)]
    motd: Option<String>,
    /// Client version advertised in the welcome
    #[arg(long, value_name = "VERSION")]
    advertise_version: Option<String>,
    /// Turn clients away with this fatal error message
    #[arg(long, value_name = "MESSAGE")]
    unwelcome: Option<String>,
    /// Seconds without a fresh message before a channel expires
    #[arg(long, value_name = "SECONDS")]
    channel_expiration: Option<u64>,
    /// Seconds between expiration sweeps
    #[arg(long, value_name = "SECONDS")]
    sweep_period: Option<u64>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let defaults = RelayConfig::default();
    let config = RelayConfig {
        database: args.database,
        advertised_version: args.advertise_version,
        motd: args.motd,
        error: args.unwelcome,
        channel_expiration: args
            .channel_expiration
            .map(Duration::from_secs)
            .unwrap_or(defaults.channel_expiration),
        expiration_check_period: args
            .sweep_period
            .map(Duration::from_secs)
            .unwrap_or(defaults.expiration_check_period),
    };

    let relay = Relay::new(config)?;
    relay.clone().spawn_pruner();

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    relay.serve(listener).await?;
    Ok(())
}
