//! WebSocket server for the session engines.

use session_server::config::Config;
use session_server::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    tracing::info!(
        addr = %config.socket_addr_string(),
        max_clients = config.max_clients,
        tick_hz = config.tick_hz,
        policy = ?config.connect_policy,
        "starting session-server"
    );

    server::run(config).await
}
