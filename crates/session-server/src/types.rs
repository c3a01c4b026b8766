//! Shared types for the session server.
//!
//! This module defines:
//! - channel aliases between stream tasks and the worker
//! - `StreamRegistry`: live connections and their outbound channels
//! - `HandlerRequest`: messages flowing into the worker

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use session_core::{Credential, EngineKey, EngineKind, JobResult, StreamId};
use session_protocol::ServerFrame;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

/// Outbound traffic for one connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),

    /// Send a close frame and stop writing.
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Registry of connected streams and their outbound channels.
///
/// Written by stream tasks on connect/disconnect, read by the worker when
/// routing registry output.
pub type StreamRegistry = Arc<RwLock<HashMap<StreamId, OutboundTx>>>;

/// Message flowing from stream tasks (and finished jobs) into the worker.
#[derive(Debug)]
pub enum HandlerRequest {
    StreamOpened {
        stream: StreamId,
        host: String,
        agent: String,
    },
    Authenticated {
        stream: StreamId,
        credential: Credential,
    },
    ObserverAdd {
        stream: StreamId,
        kind: EngineKind,
    },
    ObserverRemove {
        stream: StreamId,
        kind: EngineKind,
    },
    Message {
        stream: StreamId,
        kind: EngineKind,
        payload: Value,
    },
    StreamClosed {
        stream: StreamId,
    },
    JobFinished {
        engine: EngineKey,
        result: JobResult,
    },
    Shutdown,
}

/// Channel from stream tasks -> worker.
pub type HandlerTx = mpsc::UnboundedSender<HandlerRequest>;
pub type HandlerRx = mpsc::UnboundedReceiver<HandlerRequest>;
