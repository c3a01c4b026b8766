//! Command-level failures.
//!
//! Every variant is recovered locally: the engine has not been mutated
//! and the error goes back to the requesting stream only, as
//! `{"cmd": ..., "error": "<display string>"}`. The display strings are
//! part of the wire protocol.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Unknown `cmd`, or a command the engine kind does not support.
    #[error("invalid command")]
    InvalidCommand,

    /// Missing or unknown `engine` id, or the stream is not linked to it.
    #[error("invalid engine")]
    InvalidEngine,

    /// Valid command issued in the wrong game state or sub-stage.
    #[error("invalid state")]
    InvalidState,

    /// Caller lacks host authority (or is not the acting player).
    #[error("permission denied")]
    PermissionDenied,

    #[error("insufficient players")]
    InsufficientPlayers,

    #[error("player limit reached")]
    PlayerLimitReached,

    /// The engine no longer accepts this user.
    #[error("connection disabled")]
    ConnectionDisabled,

    /// The user already has a live stream on this engine.
    #[error("already connected")]
    AlreadyConnected,

    /// The stream is already linked to an engine of this kind.
    #[error("engine already connected")]
    EngineAlreadyConnected,

    #[error("missing map")]
    MissingMap,

    #[error("missing mission")]
    MissingMission,

    #[error("missing level")]
    MissingLevel,

    /// `connect` without an id while several engines exist and the
    /// registry runs the strict policy.
    #[error("ambiguous engine")]
    AmbiguousEngine,

    #[error("already answered")]
    AlreadyAnswered,

    #[error("invalid land")]
    InvalidLand,

    #[error("internal error")]
    Internal,

    #[error("enroll failed")]
    EnrollFailed,

    #[error("leave failed")]
    LeaveFailed,

    /// No world in the catalog fits the enrolled player count.
    #[error("no world")]
    NoWorld,
}

impl CommandError {
    /// Reply body carrying this error.
    pub fn to_reply(self) -> Map<String, Value> {
        let mut reply = Map::new();
        reply.insert("error".to_string(), Value::String(self.to_string()));
        reply
    }
}
