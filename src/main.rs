//! Binary entry point: argument parsing, logging setup, and the run loop.

use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_web::{observe, Server, ServerConfig};

/// Hardened multi-threaded HTTP/1.1 origin server.
#[derive(Parser)]
#[command(name = "warden-web", version)]
#[command(about = "Serve a static resource tree with defensive admission controls")]
struct Cli {
    /// TCP port to listen on
    #[arg(default_value_t = 8080)]
    port: u16,

    /// Bind host
    #[arg(default_value = "127.0.0.1")]
    host: IpAddr,

    /// Worker pool size
    #[arg(default_value_t = 10)]
    pool_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    observe::register_metrics();

    let config = ServerConfig::new(cli.host, cli.port, cli.pool_size);

    // The resource root must already exist; bind creates the upload
    // directory beneath it.
    let server = Server::bind(config).await.context("startup failed")?;

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            handle.shutdown();
        }
    });

    server.run().await;
    Ok(())
}
