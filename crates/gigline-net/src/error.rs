use gigline_shared::error::{ErrorKind, ProtocolError};
use thiserror::Error;

/// Errors produced while opening or running a broker connection.
#[derive(Error, Debug)]
pub enum NetError {
    /// The host API or the broker refused a private channel.
    #[error("Channel {channel} authorization rejected: {reason}")]
    Authorization { channel: String, reason: String },

    /// The transport could not be established or was lost mid-handshake.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A handshake stage did not complete in time.
    #[error("Timed out during {stage}")]
    Timeout { stage: &'static str },

    /// HTTP failure talking to the channel auth endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A frame could not be encoded or decoded.
    #[error("Frame error: {0}")]
    Frame(#[from] serde_json::Error),

    /// A frame decoded but its payload failed validation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authorization { .. } => ErrorKind::Authorization,
            _ => ErrorKind::Connection,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
