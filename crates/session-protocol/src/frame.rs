//! JSON frames and op names.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

/// Server greeting, sent once on accept.
pub const OP_HELLO: &str = "hello";

/// Client credential presentation: `{"op": "token", "d": {"token": ...}}`.
pub const OP_TOKEN: &str = "token";

pub const OP_AUTHENTICATED: &str = "authenticated";
pub const OP_UNAUTHORIZED: &str = "unauthorized";
pub const OP_ERROR: &str = "error";

/// Observer subscription: `{"op": "add", "d": {"type": "peers"}}`.
pub const OP_ADD: &str = "add";
pub const OP_REMOVE: &str = "remove";

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub op: String,

    #[serde(default)]
    pub d: Value,

    /// Optional client sequence number; must strictly increase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl ClientFrame {
    pub fn new(op: impl Into<String>, d: Value) -> Self {
        ClientFrame {
            op: op.into(),
            d,
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub op: String,

    #[serde(default)]
    pub d: Value,
}

impl ServerFrame {
    pub fn new(op: impl Into<String>, d: Value) -> Self {
        ServerFrame { op: op.into(), d }
    }

    pub fn hello() -> Self {
        ServerFrame::new(
            OP_HELLO,
            json!({
                "versionMajor": PROTOCOL_VERSION_MAJOR,
                "versionMinor": PROTOCOL_VERSION_MINOR,
            }),
        )
    }

    pub fn authenticated(username: &str) -> Self {
        ServerFrame::new(OP_AUTHENTICATED, json!({ "username": username }))
    }

    pub fn unauthorized() -> Self {
        ServerFrame::new(OP_UNAUTHORIZED, json!({ "error": ProtocolError::Unauthorized.to_string() }))
    }

    /// Error frame; `op` names the offending frame when known.
    pub fn error(err: ProtocolError, op: Option<&str>) -> Self {
        let mut d = json!({ "error": err.to_string() });
        if let Some(op) = op {
            d["op"] = Value::String(op.to_string());
        }
        ServerFrame::new(OP_ERROR, d)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
