//! Message Dispatch Façade.
//!
//! Thin typed wrappers over the [`Backend`] calls. Each one validates its
//! input, attributes failures to an operation and a target id, and returns
//! results in the order the views consume them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use gigline_shared::protocol::{Correspondent, Message, Notification};
use gigline_shared::types::{NotificationId, UserId};

use crate::api::{ApiError, Backend, ConversationSummary};
use crate::error::{ClientError, Result};
use crate::session::SessionContext;

/// One page of the correspondent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPage {
    pub correspondents: Vec<Correspondent>,
    pub page: u32,
    pub last_page: u32,
}

impl DirectoryPage {
    pub fn has_more(&self) -> bool {
        self.page < self.last_page
    }
}

#[derive(Clone)]
pub struct MessageDispatch {
    backend: Arc<dyn Backend>,
    local_user: UserId,
}

fn fetch_error(operation: &'static str, target: impl ToString, error: ApiError) -> ClientError {
    match error {
        ApiError::Unauthorized { status } => ClientError::Authorization {
            operation,
            reason: format!("HTTP {status}"),
        },
        other => ClientError::Fetch {
            operation,
            target: target.to_string(),
            reason: other.to_string(),
        },
    }
}

impl MessageDispatch {
    pub fn new(backend: Arc<dyn Backend>, session: &SessionContext) -> Self {
        Self {
            backend,
            local_user: session.user_id,
        }
    }

    /// Send `body` to `recipient` and return the server-confirmed message.
    pub async fn send(&self, recipient: UserId, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyBody);
        }
        if recipient == self.local_user {
            return Err(ClientError::Send {
                recipient,
                temp_id: None,
                reason: "cannot message yourself".into(),
            });
        }

        let message = self
            .backend
            .send_message(recipient, body)
            .await
            .map_err(|e| match e {
                ApiError::Unauthorized { status } => ClientError::Authorization {
                    operation: "send message",
                    reason: format!("HTTP {status}"),
                },
                other => ClientError::Send {
                    recipient,
                    temp_id: None,
                    reason: other.to_string(),
                },
            })?;

        message.validate().map_err(|e| ClientError::Send {
            recipient,
            temp_id: None,
            reason: format!("server returned an invalid message: {e}"),
        })?;

        info!(recipient = %recipient, message = %message.id, "Message sent");
        Ok(message)
    }

    /// History with `correspondent`, ascending by `(created_at, id)`.
    ///
    /// Invalid entries are dropped and logged, duplicates collapse to one.
    pub async fn fetch_history(&self, correspondent: UserId) -> Result<Vec<Message>> {
        let mut history = self
            .backend
            .history(correspondent)
            .await
            .map_err(|e| fetch_error("fetch history", correspondent, e))?;

        history.retain(|m| match m.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(correspondent = %correspondent, error = %e, "Dropping invalid history entry");
                false
            }
        });
        history.sort_by_key(|m| (m.created_at, m.id));
        let mut seen = HashSet::new();
        history.retain(|m| seen.insert(m.id));

        debug!(correspondent = %correspondent, count = history.len(), "History fetched");
        Ok(history)
    }

    /// All notifications of `user`, sorted by creation time DESCENDING
    /// (newest first). This is the opposite of [`fetch_history`], because
    /// the notification list is read top-down from the latest alert.
    ///
    /// [`fetch_history`]: Self::fetch_history
    pub async fn fetch_notifications(&self, user: UserId) -> Result<Vec<Notification>> {
        let mut notifications = self
            .backend
            .notifications(user)
            .await
            .map_err(|e| fetch_error("fetch notifications", user, e))?;
        notifications.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(notifications)
    }

    /// Mark a notification read on the server and return the read time to
    /// record locally.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<DateTime<Utc>> {
        let server_time = self
            .backend
            .mark_notification_read(id)
            .await
            .map_err(|e| fetch_error("mark notification read", id, e))?;
        Ok(server_time.unwrap_or_else(|| {
            debug!(notification = %id, "No read time in response, using local clock");
            Utc::now()
        }))
    }

    /// A page of the user directory as correspondents, without the local
    /// user.
    pub async fn fetch_correspondents(&self, page: u32) -> Result<DirectoryPage> {
        let page = page.max(1);
        let result = self
            .backend
            .users(page)
            .await
            .map_err(|e| fetch_error("fetch users", format!("page {page}"), e))?;

        let correspondents = result
            .users
            .into_iter()
            .filter(|u| u.id != self.local_user)
            .map(Correspondent::from)
            .collect();
        Ok(DirectoryPage {
            correspondents,
            page,
            last_page: result.last_page.max(1),
        })
    }

    /// Conversations the local user takes part in.
    pub async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let local = self.local_user;
        let conversations = self
            .backend
            .conversations()
            .await
            .map_err(|e| fetch_error("fetch conversations", local, e))?;
        Ok(conversations
            .into_iter()
            .filter(|c| c.counterpart(local).is_some())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use gigline_shared::error::ErrorKind;
    use gigline_shared::types::MessageId;

    use super::*;
    use crate::api::UserRecord;
    use crate::test_helpers::{at, message, notification, MockBackend, ADA, ME};

    fn dispatch(backend: Arc<MockBackend>) -> MessageDispatch {
        MessageDispatch::new(backend, &SessionContext::new(ME, "Me", "token"))
    }

    #[tokio::test]
    async fn send_rejects_blank_body_without_calling_backend() {
        let backend = MockBackend::new(ME);
        let err = dispatch(backend.clone()).send(ADA, "  \n").await.unwrap_err();
        assert!(matches!(err, ClientError::EmptyBody));
        assert_eq!(backend.sends(), 0);
    }

    #[tokio::test]
    async fn send_returns_confirmed_message() {
        let backend = MockBackend::new(ME);
        let msg = dispatch(backend).send(ADA, "hi").await.unwrap();
        assert_eq!(msg.id, MessageId(1001));
        assert_eq!((msg.sender_id, msg.recipient_id), (ME, ADA));
    }

    #[tokio::test]
    async fn send_failure_is_a_send_error() {
        let backend = MockBackend::new(ME);
        backend.fail_next_send(ApiError::Status {
            status: 500,
            body: "boom".into(),
        });
        let err = dispatch(backend).send(ADA, "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Send);
        assert!(matches!(err, ClientError::Send { recipient, .. } if recipient == ADA));
    }

    #[tokio::test]
    async fn history_is_ascending_and_deduplicated() {
        let backend = MockBackend::new(ME);
        backend.set_history(
            ADA,
            vec![
                message(3, ADA, ME, 30),
                message(1, ME, ADA, 10),
                message(2, ADA, ME, 10),
                message(1, ME, ADA, 10),
            ],
        );
        let ids: Vec<_> = dispatch(backend)
            .fetch_history(ADA)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[tokio::test]
    async fn history_failure_names_operation_and_target() {
        let backend = MockBackend::new(ME);
        backend.fail_history(ADA, ApiError::Timeout);
        let err = dispatch(backend).fetch_history(ADA).await.unwrap_err();
        match err {
            ClientError::Fetch { operation, target, .. } => {
                assert_eq!(operation, "fetch history");
                assert_eq!(target, "42");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_are_newest_first() {
        let backend = MockBackend::new(ME);
        backend.set_notifications(vec![notification("t1", 0), notification("t2", 60)]);
        let ids: Vec<_> = dispatch(backend)
            .fetch_notifications(ME)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(ids, ["t2", "t1"]);
    }

    #[tokio::test]
    async fn mark_read_prefers_server_time() {
        let backend = MockBackend::new(ME);
        backend.set_read_time(Some(at(90)));
        let d = dispatch(backend.clone());
        assert_eq!(d.mark_read(&"t1".into()).await.unwrap(), at(90));

        backend.set_read_time(None);
        let local = d.mark_read(&"t1".into()).await.unwrap();
        assert!(local > at(90));
    }

    #[tokio::test]
    async fn directory_excludes_local_user() {
        let backend = MockBackend::new(ME);
        backend.set_users(vec![
            UserRecord {
                id: ME,
                first_name: "Me".into(),
                last_name: String::new(),
                name: None,
                image: None,
            },
            UserRecord {
                id: ADA,
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                name: None,
                image: Some("ada.png".into()),
            },
        ]);
        let page = dispatch(backend).fetch_correspondents(0).await.unwrap();
        assert_eq!(page.page, 1);
        assert!(!page.has_more());
        assert_eq!(page.correspondents.len(), 1);
        assert_eq!(page.correspondents[0].display_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn unauthorized_fetch_is_an_authorization_error() {
        let backend = MockBackend::new(ME);
        backend.fail_history(ADA, ApiError::Unauthorized { status: 401 });
        let err = dispatch(backend).fetch_history(ADA).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }
}
