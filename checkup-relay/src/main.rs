use anyhow::Context;
use checkup_relay::RelayServer;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::{fmt::time::ChronoUtc, EnvFilter};

/// Checkup realtime relay
#[derive(Parser, Debug)]
#[command(name = "checkup-relay")]
#[command(about = "Relays patient record updates between checkup stations")]
struct Args {
    /// Bind address
    #[arg(long, env = "CHECKUP_RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listen port
    #[arg(short, long, env = "CHECKUP_RELAY_PORT", default_value = "5001")]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose, args.json);

    let server = RelayServer::bind(SocketAddr::new(args.host, args.port))
        .await
        .context("Failed to start relay")?;
    let addr = server.local_addr()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting checkup relay");
    info!("WebSocket endpoint: ws://{addr}/ws");
    info!("Health check: http://{addr}/health");

    server.run().await.context("Relay stopped")?;
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("checkup_relay={level},checkup_sync={level},tower_http=info").into()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(ChronoUtc::rfc_3339());

    if json {
        builder.json().with_target(false).init();
    } else {
        builder.with_target(true).init();
    }
}
