use gigline_net::NetError;
use gigline_shared::error::ErrorKind;
use gigline_shared::types::{TempId, UserId};
use gigline_store::StoreError;
use thiserror::Error;

/// Errors surfaced to views.
///
/// Every variant names the operation and the id it targeted. Nothing is
/// retried automatically; [`ClientError::kind`] tells the caller which
/// recovery applies.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{operation} rejected: {reason}")]
    Authorization {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} for {target} failed: {reason}")]
    Fetch {
        operation: &'static str,
        target: String,
        reason: String,
    },

    /// The send failed. When the message was inserted optimistically,
    /// `temp_id` names the entry now marked failed.
    #[error("Send to {recipient} failed: {reason}")]
    Send {
        recipient: UserId,
        temp_id: Option<TempId>,
        reason: String,
    },

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Send { .. } | Self::EmptyBody => ErrorKind::Send,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Net(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
