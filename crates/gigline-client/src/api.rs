//! REST backend.
//!
//! [`Backend`] is the seam between the dispatch façade and the host API.
//! [`HttpBackend`] talks to the real API with `reqwest`; tests substitute an
//! in-memory implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use gigline_shared::protocol::{Correspondent, Message, Notification, NotificationRecord};
use gigline_shared::types::{NotificationId, UserId};

use crate::session::SessionContext;

/// Bytes of an error response body kept in [`ApiError::Status`].
const ERROR_EXCERPT_LEN: usize = 200;

/// Failure of a single REST call, before it is attributed to an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {status}: not authorized")]
    Unauthorized { status: u16 },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unreadable response: {0}")]
    Decode(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /api/messages?recipient_id=`: the conversation with
    /// `correspondent`, in whatever order the server returns it.
    async fn history(&self, correspondent: UserId) -> ApiResult<Vec<Message>>;

    /// `POST /api/messages/send-message`
    async fn send_message(&self, recipient: UserId, content: &str) -> ApiResult<Message>;

    /// `GET /api/user/{id}/notifications`
    async fn notifications(&self, user: UserId) -> ApiResult<Vec<Notification>>;

    /// `POST /api/user/notifications/mark-as-read/{id}`. Returns the
    /// server's read time when the response carries one.
    async fn mark_notification_read(&self, id: &NotificationId)
        -> ApiResult<Option<DateTime<Utc>>>;

    /// `GET /api/users?page=`
    async fn users(&self, page: u32) -> ApiResult<UserPage>;

    /// `GET /api/conversations`
    async fn conversations(&self) -> ApiResult<Vec<ConversationSummary>>;
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Most endpoints answer either with the bare payload or wrapped in a
/// `{ status, message, data }` envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } => data,
            Self::Bare(inner) => inner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl UserRecord {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("{} {}", self.first_name.trim(), self.last_name.trim())
                .trim()
                .to_string(),
        }
    }
}

impl From<UserRecord> for Correspondent {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name(),
            avatar: user.image,
        }
    }
}

/// One page of the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub users: Vec<UserRecord>,
    pub last_page: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UsersBody {
    Paged {
        data: Vec<UserRecord>,
        #[serde(default = "first_page")]
        last_page: u32,
    },
    List(Vec<UserRecord>),
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: UsersBody,
}

impl From<UsersResponse> for UserPage {
    fn from(response: UsersResponse) -> Self {
        match response.data {
            UsersBody::Paged { data, last_page } => Self {
                users: data,
                last_page,
            },
            UsersBody::List(users) => Self {
                users,
                last_page: 1,
            },
        }
    }
}

/// Sidebar entry of the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: u64,
    pub user_one_id: UserId,
    pub user_two_id: UserId,
    #[serde(default)]
    pub latest_message: Option<String>,
    /// Kept as the server's string; its format varies by endpoint.
    #[serde(default)]
    pub last_message_time: Option<String>,
    #[serde(default)]
    pub user_one: Option<UserRecord>,
    #[serde(default)]
    pub user_two: Option<UserRecord>,
}

impl ConversationSummary {
    /// The other participant, or `None` if `local` is not part of it.
    pub fn counterpart(&self, local: UserId) -> Option<UserId> {
        if self.user_one_id == local {
            Some(self.user_two_id)
        } else if self.user_two_id == local {
            Some(self.user_one_id)
        } else {
            None
        }
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    recipient_id: UserId,
    content: &'a str,
}

/// Pull a read time out of a mark-as-read response: `{ read_at }` or
/// `{ data: { read_at } }`.
/// Leading part of an error body, cut on a character boundary.
fn error_excerpt(mut body: String) -> String {
    if body.len() > ERROR_EXCERPT_LEN {
        let mut cut = ERROR_EXCERPT_LEN;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

fn read_receipt(body: &serde_json::Value) -> Option<DateTime<Utc>> {
    [&body["read_at"], &body["data"]["read_at"]]
        .into_iter()
        .find_map(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
}

// ---------------------------------------------------------------------------
// HttpBackend
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    client: reqwest::Client,
    api_base: String,
    bearer_token: String,
}

impl HttpBackend {
    pub fn new(api_base: &str, session: &SessionContext, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bearer_token: session.api_token().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
        let response = request
            .bearer_auth(&self.bearer_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(url = %response.url(), status = %status, "API response");

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = error_excerpt(response.text().await.unwrap_or_default());
            warn!(status = %status, "API call failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Decode(e.to_string())
            }
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn history(&self, correspondent: UserId) -> ApiResult<Vec<Message>> {
        let request = self
            .client
            .get(self.url("/api/messages"))
            .query(&[("recipient_id", correspondent.0)]);
        let envelope: Envelope<Vec<Message>> = self.execute(request).await?;
        Ok(envelope.into_inner())
    }

    async fn send_message(&self, recipient: UserId, content: &str) -> ApiResult<Message> {
        let request = self
            .client
            .post(self.url("/api/messages/send-message"))
            .json(&SendRequest {
                recipient_id: recipient,
                content,
            });
        let envelope: Envelope<Message> = self.execute(request).await?;
        Ok(envelope.into_inner())
    }

    async fn notifications(&self, user: UserId) -> ApiResult<Vec<Notification>> {
        let request = self
            .client
            .get(self.url(&format!("/api/user/{user}/notifications")));
        let envelope: Envelope<Vec<NotificationRecord>> = self.execute(request).await?;
        Ok(envelope.into_inner().into_iter().map(Notification::from).collect())
    }

    async fn mark_notification_read(
        &self,
        id: &NotificationId,
    ) -> ApiResult<Option<DateTime<Utc>>> {
        let request = self
            .client
            .post(self.url(&format!("/api/user/notifications/mark-as-read/{id}")));
        let body: serde_json::Value = self.execute(request).await?;
        Ok(read_receipt(&body))
    }

    async fn users(&self, page: u32) -> ApiResult<UserPage> {
        let request = self
            .client
            .get(self.url("/api/users"))
            .query(&[("page", page)]);
        let response: UsersResponse = self.execute(request).await?;
        Ok(response.into())
    }

    async fn conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        let request = self.client.get(self.url("/api/conversations"));
        let envelope: Envelope<Vec<ConversationSummary>> = self.execute(request).await?;
        Ok(envelope.into_inner())
    }
}
