//! session-protocol
//!
//! Wire-level model of one client connection.
//!
//! Every WebSocket text message carries one JSON frame
//! `{"op": <string>, "d": <payload>, "seq": <optional int>}`.
//!
//! - [`frame`]  : `ClientFrame` / `ServerFrame`, op names, protocol version
//! - [`error`]  : `ProtocolError` and its wire strings
//! - [`stream`] : `StreamProtocol`, the per-connection state machine
//!   (`Invalid -> HelloSent -> Authenticated`, `Error` on violations)

pub mod error;
pub mod frame;
pub mod stream;

pub use error::ProtocolError;
pub use frame::{ClientFrame, ServerFrame, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
pub use stream::{CredentialVerifier, Inbound, StreamProtocol, StreamState, MAX_VIOLATIONS};
