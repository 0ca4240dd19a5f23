use gigline_shared::error::{ErrorKind, ProtocolError};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The operation referenced an id the local state does not hold.
    #[error("{entity} {id} not found in local state")]
    NotFound { entity: &'static str, id: String },

    /// A conversation operation was issued with nothing selected.
    #[error("No conversation is selected")]
    NoActiveConversation,

    /// A message failed validation and was not applied.
    #[error("Invalid message: {0}")]
    Invalid(#[from] ProtocolError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::NoActiveConversation => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::Fetch,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
