//! Per-connection protocol state machine.
//!
//! `StreamProtocol` turns raw text frames into [`Inbound`] actions for the
//! server and never touches the network itself:
//! - `Invalid -> HelloSent` when the greeting goes out,
//! - `HelloSent -> Authenticated` on a verified `token` frame,
//! - any state -> `Error` on a fatal violation (malformed frame, stale
//!   `seq`, anything but `token` before authentication).
//!
//! In `Error` every frame is answered with `invalid stream` and counts as
//! another violation. After [`MAX_VIOLATIONS`] the connection is closed.

use serde_json::Value;
use session_core::{Credential, EngineKind};
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::frame::{ClientFrame, ServerFrame, OP_ADD, OP_REMOVE, OP_TOKEN};

/// Violations tolerated before the connection is closed.
pub const MAX_VIOLATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Invalid,
    HelloSent,
    Authenticated,
    Error,
}

/// Turns a presented token into a credential.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Credential>;
}

/// What the server must do with one received frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Send this frame back to the same connection.
    Reply(ServerFrame),

    /// The connection authenticated; register the credential.
    Authenticated(Credential),

    ObserverAdd(EngineKind),
    ObserverRemove(EngineKind),

    /// Engine command frame (`{"op": "conquest", "d": {"cmd": ...}}`).
    Engine { kind: EngineKind, payload: Value },

    /// Drop the connection.
    Close,
}

#[derive(Debug, Default)]
pub struct StreamProtocol {
    state: StreamState,
    credential: Option<Credential>,
    last_seq: Option<u64>,
    violations: u32,
}

impl StreamProtocol {
    pub fn new() -> Self {
        StreamProtocol::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Greeting to send on accept.
    pub fn hello(&mut self) -> ServerFrame {
        if self.state == StreamState::Invalid {
            self.state = StreamState::HelloSent;
        }
        ServerFrame::hello()
    }

    /// Process one text frame.
    pub fn receive(&mut self, text: &str, verifier: &dyn CredentialVerifier) -> Vec<Inbound> {
        if self.state == StreamState::Error {
            return self.violation(ProtocolError::InvalidStream, None);
        }

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => return self.violation(err, None),
        };

        if let Some(seq) = frame.seq {
            if self.last_seq.map(|last| seq <= last).unwrap_or(false) {
                return self.violation(ProtocolError::StaleSequence, Some(&frame.op));
            }
            self.last_seq = Some(seq);
        }

        trace!(op = %frame.op, state = ?self.state, "frame received");

        match self.state {
            StreamState::Invalid => self.violation(ProtocolError::InvalidStream, Some(&frame.op)),
            StreamState::HelloSent => self.receive_token(&frame, verifier),
            StreamState::Authenticated => self.receive_authenticated(frame),
            StreamState::Error => self.violation(ProtocolError::InvalidStream, Some(&frame.op)),
        }
    }

    fn receive_token(&mut self, frame: &ClientFrame, verifier: &dyn CredentialVerifier) -> Vec<Inbound> {
        if frame.op != OP_TOKEN {
            return self.violation(ProtocolError::InvalidToken, Some(&frame.op));
        }

        let token = match &frame.d {
            Value::String(token) => Some(token.as_str()),
            Value::Object(map) => map.get("token").and_then(Value::as_str),
            _ => None,
        };

        let Some(token) = token else {
            return self.violation(ProtocolError::InvalidToken, Some(&frame.op));
        };

        match verifier.verify(token).filter(Credential::is_valid) {
            Some(credential) => {
                debug!(user = %credential.username, "stream authenticated");
                self.state = StreamState::Authenticated;
                self.credential = Some(credential.clone());
                vec![
                    Inbound::Reply(ServerFrame::authenticated(&credential.username)),
                    Inbound::Authenticated(credential),
                ]
            }
            None => {
                self.violations += 1;
                warn!(violations = self.violations, "token rejected");
                let mut out = vec![Inbound::Reply(ServerFrame::unauthorized())];
                if self.violations >= MAX_VIOLATIONS {
                    out.push(Inbound::Close);
                }
                out
            }
        }
    }

    fn receive_authenticated(&mut self, frame: ClientFrame) -> Vec<Inbound> {
        let ClientFrame { op, d, .. } = frame;

        if op == OP_ADD || op == OP_REMOVE {
            return match observer_kinds(&d) {
                Some(kinds) => kinds
                    .into_iter()
                    .map(|kind| match op.as_str() {
                        OP_ADD => Inbound::ObserverAdd(kind),
                        _ => Inbound::ObserverRemove(kind),
                    })
                    .collect(),
                None => vec![Inbound::Reply(ServerFrame::error(
                    ProtocolError::InvalidOperation,
                    Some(&op),
                ))],
            };
        }

        match EngineKind::from_op(&op) {
            Some(kind) => vec![Inbound::Engine { kind, payload: d }],
            None => {
                debug!(op = %op, "unknown operation");
                vec![Inbound::Reply(ServerFrame::error(
                    ProtocolError::InvalidOperation,
                    Some(&op),
                ))]
            }
        }
    }

    fn violation(&mut self, err: ProtocolError, op: Option<&str>) -> Vec<Inbound> {
        self.violations += 1;
        if err.is_fatal() {
            self.state = StreamState::Error;
        }

        warn!(error = %err, violations = self.violations, "protocol violation");

        let mut out = vec![Inbound::Reply(ServerFrame::error(err, op))];
        if self.violations >= MAX_VIOLATIONS {
            out.push(Inbound::Close);
        }
        out
    }
}

/// Subscription targets of an `add`/`remove` payload: one
/// `{"type": ...}` object or an array of them. `None` if any is unknown.
fn observer_kinds(d: &Value) -> Option<Vec<EngineKind>> {
    let one = |v: &Value| {
        v.get("type")
            .and_then(Value::as_str)
            .and_then(EngineKind::from_observer)
    };

    match d {
        Value::Array(list) if !list.is_empty() => list.iter().map(one).collect(),
        Value::Object(_) => one(d).map(|kind| vec![kind]),
        _ => None,
    }
}
