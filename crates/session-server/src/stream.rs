//! Per-connection WebSocket task.
//!
//! Each accepted socket gets:
//! - a writer task draining its `Outbound` channel into the socket,
//! - a reader loop feeding text frames through `StreamProtocol` and
//!   forwarding the resulting actions to the engine handler.
//!
//! When either side ends, the stream is removed from the registry and the
//! worker is told so it can unlink engines and notify observers.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use session_core::StreamId;
use session_protocol::{CredentialVerifier, Inbound, StreamProtocol};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::handler::EngineHandler;
use crate::types::{Outbound, OutboundRx, OutboundTx, StreamRegistry};

/// Run the I/O loop for a single connection.
pub(crate) async fn run_stream(
    stream_id: StreamId,
    socket: TcpStream,
    peer: SocketAddr,
    handler: EngineHandler,
    verifier: Arc<dyn CredentialVerifier>,
    streams: StreamRegistry,
) -> anyhow::Result<()> {
    let mut agent = String::new();
    let capture_agent = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(socket, capture_agent).await?;

    debug!(stream = %stream_id, %peer, agent = %agent, "websocket handshake complete");

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx): (OutboundTx, OutboundRx) = mpsc::unbounded_channel();

    {
        let mut guard = streams.write().await;
        guard.insert(stream_id, out_tx.clone());
    }
    handler.stream_opened(stream_id, peer.ip().to_string(), agent);

    // Writer task: serialize frames until told to close.
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let text = frame.to_text();
                    trace!(stream = %stream_id, frame = %text, "send");
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!(stream = %stream_id, error = %e, "write failed");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut protocol = StreamProtocol::new();
    let _ = out_tx.send(Outbound::Frame(protocol.hello()));

    'read: while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(stream = %stream_id, error = %e, "read failed");
                break;
            }
        };

        let text = if msg.is_text() {
            msg.to_text().unwrap_or_default().to_string()
        } else if msg.is_binary() {
            String::from_utf8_lossy(&msg.into_data()).into_owned()
        } else if msg.is_close() {
            break;
        } else {
            // ping/pong are answered by tungstenite
            continue;
        };

        trace!(stream = %stream_id, frame = %text, "recv");

        for action in protocol.receive(&text, verifier.as_ref()) {
            match action {
                Inbound::Reply(frame) => {
                    let _ = out_tx.send(Outbound::Frame(frame));
                }
                Inbound::Authenticated(credential) => {
                    info!(stream = %stream_id, user = %credential.username, "authenticated");
                    handler.authenticated(stream_id, credential);
                }
                Inbound::ObserverAdd(kind) => handler.observer_add(stream_id, kind),
                Inbound::ObserverRemove(kind) => handler.observer_remove(stream_id, kind),
                Inbound::Engine { kind, payload } => handler.message(stream_id, kind, payload),
                Inbound::Close => {
                    warn!(stream = %stream_id, violations = protocol.violations(), "closing after protocol violations");
                    let _ = out_tx.send(Outbound::Close);
                    break 'read;
                }
            }
        }
    }

    // Remove stream from registry
    {
        let mut guard = streams.write().await;
        guard.remove(&stream_id);
    }
    handler.stream_closed(stream_id);

    let _ = out_tx.send(Outbound::Close);
    drop(out_tx);
    let _ = writer.await;

    Ok(())
}
