use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use tokio::net::TcpListener;

mod conn;
mod error;
mod protocol;
mod relay;
mod room;
mod store;

use relay::RelayEngine;
use room::Registry;
use store::{MemStore, SessionStore};

#[derive(Parser)]
#[command(version, about = "Zeal AMA real-time broker", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8002)]
    port: u16,

    /// Seconds to wait for a disconnected host to reconnect before ending
    /// its session (0 = keep the session open indefinitely)
    #[arg(long, default_value_t = 0)]
    host_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let store: Arc<dyn SessionStore> = Arc::new(MemStore::default());
    let engine = Arc::new(RelayEngine::new()?);
    let registry = Registry::new(store, engine, Duration::from_secs(cli.host_grace_secs));

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("zeal broker listening on {addr}");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => conn::handle_connection(ws, addr, registry).await,
                        Err(e) => log::warn!("ws handshake with {addr} failed: {e}"),
                    }
                });
            }
            Err(e) => log::warn!("tcp accept error: {e}"),
        }
    }
}
