use serde::Serialize;
use thiserror::Error;

/// Coarse classification every layer maps its errors onto, so views can
/// decide between re-authenticating, showing a disconnected indicator,
/// offering a retry, or refetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Channel or API auth rejected; the view must re-authenticate.
    Authorization,
    /// Transport unreachable or dropped; recoverable, no automatic retry.
    Connection,
    /// A read call failed.
    Fetch,
    /// A send call failed.
    Send,
    /// An operation referenced an identifier the local state does not hold.
    NotFound,
    /// The client was configured with unusable values.
    Configuration,
}

/// Payloads that failed validation at the transport boundary.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },

    #[error("Message {id} has an empty body")]
    EmptyBody { id: String },

    #[error("Message {id} has the same sender and recipient")]
    SelfAddressed { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
