//! Private channel authorization.
//!
//! Before subscribing to a `private-*` channel the client asks the host API
//! to sign `(socket_id, channel_name)`. One request is made per channel per
//! open attempt; a rejection surfaces to the caller and is never retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NetError, Result};

/// Signature returned by the auth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelAuth {
    /// `app_key:hex_signature`
    pub auth: String,
    /// Only present for presence channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<ChannelAuth>;
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    socket_id: &'a str,
    channel_name: &'a str,
}

/// Authorizes channels against `POST {api_base}/api/broadcasting/auth`.
pub struct HttpChannelAuthorizer {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: String,
}

impl HttpChannelAuthorizer {
    pub fn new(api_base: &str, bearer_token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/broadcasting/auth", api_base.trim_end_matches('/')),
            bearer_token: bearer_token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<ChannelAuth> {
        debug!(channel = %channel_name, socket_id = %socket_id, "Requesting channel auth");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.bearer_token)
            .json(&AuthRequest {
                socket_id,
                channel_name,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NetError::Timeout {
                        stage: "channel authorization",
                    }
                } else {
                    NetError::Connection(format!("channel auth request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(channel = %channel_name, status = %status, "Channel auth rejected");
            return Err(NetError::Authorization {
                channel: channel_name.to_string(),
                reason: format!("auth endpoint returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(NetError::Connection(format!(
                "channel auth for {channel_name} returned {status}"
            )));
        }

        let auth: ChannelAuth = response.json().await.map_err(|e| NetError::Authorization {
            channel: channel_name.to_string(),
            reason: format!("unreadable auth response: {e}"),
        })?;
        Ok(auth)
    }
}
