//! Explicit session context.
//!
//! Session issuance happens outside this crate; whoever authenticates the
//! user builds a [`SessionContext`] and passes it to every component that
//! needs the user's identity or credentials.

use gigline_shared::types::UserId;

#[derive(Clone)]
pub struct SessionContext {
    /// The signed-in user. Also selects the private notification channel.
    pub user_id: UserId,

    pub display_name: String,

    /// Bearer token sent with every REST and channel auth request.
    api_token: String,
}

impl SessionContext {
    pub fn new(user_id: UserId, display_name: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            api_token: api_token.into(),
        }
    }

    pub fn api_token(&self) -> &str {
        &self.api_token
    }
}

// Keep the token out of logs.
impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_omits_token() {
        let session = SessionContext::new(UserId(7), "Ada", "secret-token");
        let rendered = format!("{session:?}");
        assert!(rendered.contains("Ada"));
        assert!(!rendered.contains("secret-token"));
    }
}
