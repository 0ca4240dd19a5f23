use serde::Serialize;
use tokio::sync::broadcast;

use gigline_shared::types::{ConnectionMode, TempId, UserId};

pub const EVENT_CONVERSATION_CHANGED: &str = "conversation-changed";
pub const EVENT_UNREAD_CHANGED: &str = "unread-changed";
pub const EVENT_NOTIFICATIONS_CHANGED: &str = "notifications-changed";
pub const EVENT_SEND_FAILED: &str = "send-failed";
pub const EVENT_CONNECTION_MODE_CHANGED: &str = "connection-mode-changed";

/// Change notifications for views. Views re-read the inbox state they
/// display when they receive one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum InboxEvent {
    /// The active conversation's sequence or load phase changed.
    ConversationChanged { correspondent: UserId },
    UnreadChanged { correspondent: UserId, count: usize },
    NotificationsChanged { unread: usize },
    SendFailed { temp_id: TempId, reason: String },
    ConnectionModeChanged {
        mode: ConnectionMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl InboxEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationChanged { .. } => EVENT_CONVERSATION_CHANGED,
            Self::UnreadChanged { .. } => EVENT_UNREAD_CHANGED,
            Self::NotificationsChanged { .. } => EVENT_NOTIFICATIONS_CHANGED,
            Self::SendFailed { .. } => EVENT_SEND_FAILED,
            Self::ConnectionModeChanged { .. } => EVENT_CONNECTION_MODE_CHANGED,
        }
    }
}

pub fn emit_event(tx: &broadcast::Sender<InboxEvent>, event: InboxEvent) {
    let name = event.name();
    if tx.send(event).is_err() {
        tracing::trace!(event = name, "No view subscribed");
    }
}
