//! WebSocket listener and top-level server wiring.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections and assigns each a `StreamId`.
//! - Spawns:
//!   - a per-connection task upgrading to WebSocket and handling I/O,
//!   - a single engine worker that owns the `EngineRegistry`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use session_core::{RegistrySettings, StreamId, UserDirectory};
use session_protocol::CredentialVerifier;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::TokenTable;
use crate::config::Config;
use crate::directory::MemoryDirectory;
use crate::handler::EngineHandler;
use crate::stream::run_stream;
use crate::types::StreamRegistry;

/// Counter for assigning unique `StreamId`s.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

fn next_stream_id() -> StreamId {
    StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
}

/// A bound, not yet serving, session server.
pub struct Server {
    config: Config,
    listener: TcpListener,
    streams: StreamRegistry,
    handler: EngineHandler,
    worker: JoinHandle<()>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl Server {
    /// Bind the listener and start the engine worker.
    pub async fn bind(
        config: Config,
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn UserDirectory>,
    ) -> anyhow::Result<Self> {
        let worlds = config.load_worlds()?;
        Server::bind_with(config.registry_settings(worlds), config, verifier, directory).await
    }

    /// As [`Server::bind`], with explicit registry settings.
    pub async fn bind_with(
        settings: RegistrySettings,
        config: Config,
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn UserDirectory>,
    ) -> anyhow::Result<Self> {
        let addr = config.socket_addr_string();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;

        let streams: StreamRegistry = Arc::new(tokio::sync::RwLock::new(Default::default()));
        let (handler, worker) = EngineHandler::spawn(settings, streams.clone(), directory);

        Ok(Server {
            config,
            listener,
            streams,
            handler,
            worker,
            verifier,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> EngineHandler {
        self.handler.clone()
    }

    /// Accept connections until the worker stops.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Server {
            config,
            listener,
            streams,
            handler,
            mut worker,
            verifier,
        } = self;

        info!(addr = %listener.local_addr()?, max_clients = config.max_clients, "listening");

        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut worker => {
                    info!("engine worker stopped, no longer accepting");
                    return Ok(());
                }
            };

            let current = {
                let guard = streams.read().await;
                guard.len()
            };

            if current >= config.max_clients {
                warn!(%peer, max_clients = config.max_clients, "rejecting connection: max_clients reached");
                continue;
            }

            let stream_id = next_stream_id();
            debug!(stream = %stream_id, %peer, "accepted connection");

            let handler = handler.clone();
            let verifier = Arc::clone(&verifier);
            let streams = streams.clone();

            tokio::spawn(async move {
                match run_stream(stream_id, socket, peer, handler, verifier, streams).await {
                    Ok(()) => debug!(stream = %stream_id, "disconnected"),
                    Err(e) => debug!(stream = %stream_id, error = %e, "connection error"),
                }
            });
        }
    }
}

/// Load the configured files and serve until shut down.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let tokens = match &config.token_file {
        Some(path) => TokenTable::load(path)?,
        None => {
            warn!("no SESSION_TOKEN_FILE set, every token will be rejected");
            TokenTable::new()
        }
    };

    let directory = match &config.user_file {
        Some(path) => MemoryDirectory::load(path)?,
        None => MemoryDirectory::new(),
    };

    let server = Server::bind(config, Arc::new(tokens), Arc::new(directory)).await?;
    let handler = server.handler();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            handler.shutdown();
        }
    });

    server.serve().await
}
