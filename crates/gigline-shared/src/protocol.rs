use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MessageId, NotificationId, UserId};

/// A confirmed one-to-one chat message as the backend returns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<u64>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// Message body. Never empty once validated.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Reject payloads the store must never see.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.content.trim().is_empty() {
            return Err(ProtocolError::EmptyBody {
                id: self.id.to_string(),
            });
        }
        if self.sender_id == self.recipient_id {
            return Err(ProtocolError::SelfAddressed {
                id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// The other party of this message from `local`'s point of view, or
    /// `None` if `local` is neither sender nor recipient.
    pub fn counterpart(&self, local: UserId) -> Option<UserId> {
        if self.sender_id == local {
            Some(self.recipient_id)
        } else if self.recipient_id == local {
            Some(self.sender_id)
        } else {
            None
        }
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }
}

/// The other party of a conversation, as listed by the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correspondent {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A side-channel alert, independent of any conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    /// Backend notification class, kept for display filtering.
    pub kind: String,
    /// Name of the user who triggered the notification.
    pub actor: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// `None` while unread. Once set it is never cleared.
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NotificationData {
    #[serde(default)]
    user: String,
    #[serde(default)]
    message: String,
}

/// Row shape of the batch notification endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRecord {
    id: NotificationId,
    #[serde(rename = "type", default)]
    kind: String,
    data: NotificationData,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<NotificationRecord> for Notification {
    fn from(r: NotificationRecord) -> Self {
        Self {
            id: r.id,
            kind: r.kind,
            actor: r.data.user,
            message: r.data.message,
            created_at: r.created_at,
            read_at: r.read_at,
        }
    }
}

/// Payload of a live `BroadcastNotificationCreated` event: the `data`
/// fields are flattened next to `id` and `type`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPush {
    id: NotificationId,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl NotificationPush {
    /// Pushed notifications are always unread. Payloads without a creation
    /// time are stamped with `received_at`.
    pub fn into_notification(self, received_at: DateTime<Utc>) -> Notification {
        Notification {
            id: self.id,
            kind: self.kind,
            actor: self.user,
            message: self.message,
            created_at: self.created_at.unwrap_or(received_at),
            read_at: None,
        }
    }
}

/// Accepted shapes of a `MessageSent` broadcast body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageSentPayload {
    Wrapped { data: Message },
    Keyed { message: Message },
    Bare(Message),
}

impl MessageSentPayload {
    pub fn into_message(self) -> Message {
        match self {
            Self::Wrapped { data } => data,
            Self::Keyed { message } => message,
            Self::Bare(message) => message,
        }
    }
}

/// Why a broker connection ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The broker closed the socket.
    ClosedByServer { code: Option<u16>, reason: String },
    /// No pong came back within the pong timeout.
    ActivityTimeout,
    /// The socket failed underneath us.
    TransportError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClosedByServer { code: Some(code), reason } => {
                write!(f, "closed by server ({code}): {reason}")
            }
            Self::ClosedByServer { code: None, reason } => write!(f, "closed by server: {reason}"),
            Self::ActivityTimeout => f.write_str("activity timeout"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Typed live events delivered by a subscription, validated at the
/// transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    MessageSent { message: Message },
    NotificationCreated { notification: Notification },
    Disconnected { reason: DisconnectReason },
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageSent { .. } => "MessageSent",
            Self::NotificationCreated { .. } => "NotificationCreated",
            Self::Disconnected { .. } => "Disconnected",
        }
    }
}
