//! Protocol-level failures.
//!
//! Unlike command errors these concern the connection itself. Each one is
//! reported in an `{"op": "error"}` frame; the display strings are part of
//! the wire protocol.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The message is not a JSON frame.
    #[error("invalid json")]
    InvalidJson,

    /// A frame other than `token` before authentication.
    #[error("invalid token")]
    InvalidToken,

    /// The token was rejected by the verifier.
    #[error("unauthorized")]
    Unauthorized,

    /// `seq` did not increase.
    #[error("stale sequence")]
    StaleSequence,

    /// Unknown op, or a malformed subscription.
    #[error("invalid operation")]
    InvalidOperation,

    /// The stream is in the error state.
    #[error("invalid stream")]
    InvalidStream,
}

impl ProtocolError {
    /// Whether the error moves the stream into the `Error` state.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidJson
                | ProtocolError::InvalidToken
                | ProtocolError::StaleSequence
                | ProtocolError::InvalidStream
        )
    }
}
