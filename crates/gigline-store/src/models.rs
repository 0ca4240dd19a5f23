//! In-memory records held by the conversation store.
//!
//! Every struct derives `Serialize` so views can hand it straight to a
//! renderer.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use gigline_shared::protocol::Message;
use gigline_shared::types::{MessageId, TempId, UserId};

// ---------------------------------------------------------------------------
// MessageKey
// ---------------------------------------------------------------------------

/// Identity of a message in the active sequence.
///
/// Confirmed ids order numerically. Temporary ids order after every
/// confirmed id, so a pending message sharing a timestamp with a confirmed
/// one sorts after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKey {
    Confirmed(MessageId),
    Pending(TempId),
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Confirmed(a), Self::Confirmed(b)) => a.cmp(b),
            (Self::Pending(a), Self::Pending(b)) => a.cmp(b),
            (Self::Confirmed(_), Self::Pending(_)) => Ordering::Less,
            (Self::Pending(_), Self::Confirmed(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{id}"),
            Self::Pending(tmp) => write!(f, "{tmp}"),
        }
    }
}

// ---------------------------------------------------------------------------
// StoredMessage
// ---------------------------------------------------------------------------

/// Server confirmation state of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Sent locally, no server answer yet.
    Pending,
    /// The send request failed; the entry stays visible until retried or
    /// discarded.
    Failed { reason: String },
    Confirmed,
}

/// One entry of the active conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub key: MessageKey,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

impl StoredMessage {
    pub fn confirmed(message: Message) -> Self {
        Self {
            key: MessageKey::Confirmed(message.id),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            body: message.content,
            created_at: message.created_at,
            delivery: Delivery::Confirmed,
        }
    }

    /// Ordering key of the sequence: `(created_at, key)` ascending.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageKey) {
        (self.created_at, self.key)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.delivery, Delivery::Confirmed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self.key {
            MessageKey::Pending(tmp) => Some(tmp),
            MessageKey::Confirmed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Load lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadPhase {
    /// No fetch issued for the selected correspondent.
    Empty,
    /// A history fetch is in flight.
    Loading,
    /// A snapshot has been applied; live events are merged on top.
    Loaded,
}

/// Tag carried by an in-flight history fetch. A snapshot is only applied
/// if its ticket still matches the active selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub(crate) correspondent: UserId,
    pub(crate) generation: u64,
}

impl LoadTicket {
    pub fn correspondent(&self) -> UserId {
        self.correspondent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied { count: usize },
    /// The selection changed (or a newer load started) while this fetch was
    /// in flight; the result was discarded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    Appended,
    /// The id is already in the sequence.
    Duplicate,
    /// Addressed to the local user but outside the active conversation.
    Unread { correspondent: UserId, count: usize },
    /// Neither sender nor recipient is the local user.
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Marked(DateTime<Utc>),
    /// Already read; carries the original read time, which is kept.
    AlreadyRead(DateTime<Utc>),
}

impl ReadOutcome {
    pub fn read_at(&self) -> DateTime<Utc> {
        match self {
            Self::Marked(at) | Self::AlreadyRead(at) => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn pending_keys_sort_after_confirmed_keys() {
        let confirmed = MessageKey::Confirmed(MessageId(u64::MAX));
        let pending = MessageKey::Pending(TempId(Uuid::nil()));
        assert!(confirmed < pending);
        assert!(MessageKey::Confirmed(MessageId(1)) < MessageKey::Confirmed(MessageId(2)));
    }
}
