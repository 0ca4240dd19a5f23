//! Conversation state store.
//!
//! Holds the message sequence of the active conversation and the unread
//! counters of every other conversation. The sequence is kept strictly
//! ordered by `(created_at, key)` with no duplicate keys after every
//! operation; all mutations are synchronous so none of them can be split
//! by an await point in the caller.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use gigline_shared::error::ProtocolError;
use gigline_shared::protocol::Message;
use gigline_shared::types::{TempId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{
    Delivery, IncomingOutcome, LoadPhase, LoadTicket, MessageKey, SnapshotOutcome, StoredMessage,
};

#[derive(Debug)]
struct ActiveConversation {
    correspondent: UserId,
    phase: LoadPhase,
    /// Phase to fall back to if the in-flight load fails.
    phase_before_load: LoadPhase,
    messages: Vec<StoredMessage>,
    /// Confirmed keys merged since the current load began. The snapshot may
    /// predate them, so they survive it.
    merged_while_loading: HashSet<MessageKey>,
    last_error: Option<String>,
}

impl ActiveConversation {
    fn new(correspondent: UserId) -> Self {
        Self {
            correspondent,
            phase: LoadPhase::Empty,
            phase_before_load: LoadPhase::Empty,
            messages: Vec::new(),
            merged_while_loading: HashSet::new(),
            last_error: None,
        }
    }

    fn contains(&self, key: &MessageKey) -> bool {
        self.messages.iter().any(|m| &m.key == key)
    }

    fn position(&self, key: &MessageKey) -> Option<usize> {
        self.messages.iter().position(|m| &m.key == key)
    }

    /// Insert at the ordered position. Returns `false` if the key exists.
    fn insert_ordered(&mut self, message: StoredMessage) -> bool {
        if self.contains(&message.key) {
            return false;
        }
        if self.phase == LoadPhase::Loading && message.is_confirmed() {
            self.merged_while_loading.insert(message.key);
        }
        let key = message.sort_key();
        let at = self.messages.partition_point(|m| m.sort_key() < key);
        self.messages.insert(at, message);
        true
    }
}

/// Single source of truth for the active conversation.
#[derive(Debug)]
pub struct ConversationStore {
    local_user: UserId,
    active: Option<ActiveConversation>,
    /// Bumped on every selection change and every load, so each in-flight
    /// fetch can be recognised as stale.
    generation: u64,
    unread: HashMap<UserId, usize>,
}

impl ConversationStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            active: None,
            generation: 0,
            unread: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn active_correspondent(&self) -> Option<UserId> {
        self.active.as_ref().map(|a| a.correspondent)
    }

    /// Phase of the active conversation; `Empty` when nothing is selected.
    pub fn phase(&self) -> LoadPhase {
        self.active
            .as_ref()
            .map(|a| a.phase)
            .unwrap_or(LoadPhase::Empty)
    }

    /// Ordered messages of the active conversation.
    pub fn messages(&self) -> &[StoredMessage] {
        self.active
            .as_ref()
            .map(|a| a.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Why the last history fetch failed, until a later one succeeds.
    pub fn last_error(&self) -> Option<&str> {
        self.active.as_ref().and_then(|a| a.last_error.as_deref())
    }

    pub fn unread_count(&self, correspondent: UserId) -> usize {
        self.unread.get(&correspondent).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        self.unread.values().sum()
    }

    // -- selection ----------------------------------------------------------

    /// Make `correspondent` the active conversation.
    ///
    /// The previous sequence is discarded and the new one starts `Empty`.
    /// Selecting the already active correspondent changes nothing and
    /// returns `false`.
    pub fn select(&mut self, correspondent: UserId) -> bool {
        if self.active_correspondent() == Some(correspondent) {
            return false;
        }
        self.generation += 1;
        self.active = Some(ActiveConversation::new(correspondent));
        self.unread.remove(&correspondent);
        debug!(correspondent = %correspondent, generation = self.generation, "Conversation selected");
        true
    }

    pub fn clear_selection(&mut self) {
        if self.active.take().is_some() {
            self.generation += 1;
        }
    }

    // -- snapshot -----------------------------------------------------------

    /// Enter `Loading` and tag the fetch about to be issued.
    pub fn begin_load(&mut self) -> Result<LoadTicket> {
        self.generation += 1;
        let generation = self.generation;
        let active = self
            .active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?;
        if active.phase != LoadPhase::Loading {
            active.phase_before_load = active.phase;
            active.merged_while_loading.clear();
        }
        active.phase = LoadPhase::Loading;
        Ok(LoadTicket {
            correspondent: active.correspondent,
            generation,
        })
    }

    fn ticket_is_current(&self, ticket: &LoadTicket) -> bool {
        ticket.generation == self.generation
            && self.active_correspondent() == Some(ticket.correspondent)
    }

    /// Replace the sequence with a fetched history.
    ///
    /// Discarded as `Stale` unless `ticket` is still current. The fetched
    /// messages are validated, deduplicated and sorted. Carried over from
    /// the current sequence:
    ///
    /// - pending and failed local entries;
    /// - confirmed messages merged after `begin_load`, which the server may
    ///   have built the snapshot without.
    ///
    /// A pending entry has no server id yet, so if the snapshot already
    /// holds its server copy both are shown until `confirm_optimistic`
    /// removes the pending one.
    pub fn apply_snapshot(
        &mut self,
        ticket: &LoadTicket,
        history: Vec<Message>,
    ) -> Result<SnapshotOutcome> {
        if !self.ticket_is_current(ticket) {
            debug!(
                correspondent = %ticket.correspondent,
                "Discarding stale history snapshot"
            );
            return Ok(SnapshotOutcome::Stale);
        }

        let local = self.local_user;
        let correspondent = ticket.correspondent;
        let mut fresh = ActiveConversation::new(correspondent);

        for message in history {
            if let Err(e) = message.validate() {
                warn!(error = %e, "Skipping invalid history entry");
                continue;
            }
            if !message.is_between(local, correspondent) {
                warn!(
                    message = %message.id,
                    correspondent = %correspondent,
                    "Skipping history entry from another conversation"
                );
                continue;
            }
            fresh.insert_ordered(StoredMessage::confirmed(message));
        }

        let active = self
            .active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?;
        let live = std::mem::take(&mut active.merged_while_loading);
        for carried in active
            .messages
            .drain(..)
            .filter(|m| !m.is_confirmed() || live.contains(&m.key))
        {
            fresh.insert_ordered(carried);
        }

        let count = fresh.messages.len();
        active.messages = fresh.messages;
        active.phase = LoadPhase::Loaded;
        active.last_error = None;

        info!(correspondent = %correspondent, count, "History snapshot applied");
        Ok(SnapshotOutcome::Applied { count })
    }

    /// Record a failed fetch. Nothing is applied and the phase returns to
    /// what it was before loading. Returns `false` for a stale ticket.
    pub fn fail_load(&mut self, ticket: &LoadTicket, reason: impl Into<String>) -> bool {
        if !self.ticket_is_current(ticket) {
            return false;
        }
        let reason = reason.into();
        if let Some(active) = self.active.as_mut() {
            warn!(correspondent = %active.correspondent, reason = %reason, "History fetch failed");
            active.phase = active.phase_before_load;
            active.merged_while_loading.clear();
            active.last_error = Some(reason);
        }
        true
    }

    // -- live events --------------------------------------------------------

    /// Merge a pushed message.
    ///
    /// Applied only when it belongs to the active conversation; an id that
    /// is already present is a no-op. A message for the local user in any
    /// other conversation bumps that conversation's unread counter instead.
    pub fn append_incoming(&mut self, message: Message) -> Result<IncomingOutcome> {
        message.validate()?;

        let Some(counterpart) = message.counterpart(self.local_user) else {
            debug!(message = %message.id, "Ignoring message between other users");
            return Ok(IncomingOutcome::Foreign);
        };

        match self.active.as_mut() {
            Some(active) if active.correspondent == counterpart => {
                if active.insert_ordered(StoredMessage::confirmed(message)) {
                    Ok(IncomingOutcome::Appended)
                } else {
                    Ok(IncomingOutcome::Duplicate)
                }
            }
            _ => {
                // Our own sends from another device count as read.
                if message.sender_id == self.local_user {
                    return Ok(IncomingOutcome::Foreign);
                }
                let count = self.unread.entry(counterpart).or_insert(0);
                *count += 1;
                Ok(IncomingOutcome::Unread {
                    correspondent: counterpart,
                    count: *count,
                })
            }
        }
    }

    // -- optimistic sends ---------------------------------------------------

    /// Insert a locally authored message ahead of server confirmation.
    pub fn append_optimistic(&mut self, temp_id: TempId, body: &str) -> Result<()> {
        self.append_optimistic_at(temp_id, body, Utc::now())
    }

    /// [`append_optimistic`](Self::append_optimistic) with an explicit local
    /// timestamp.
    pub fn append_optimistic_at(
        &mut self,
        temp_id: TempId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        if body.trim().is_empty() {
            return Err(ProtocolError::EmptyBody {
                id: temp_id.to_string(),
            }
            .into());
        }
        let local = self.local_user;
        let active = self
            .active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?;
        let recipient = active.correspondent;

        let inserted = active.insert_ordered(StoredMessage {
            key: MessageKey::Pending(temp_id),
            sender_id: local,
            recipient_id: recipient,
            body: body.to_string(),
            created_at,
            delivery: Delivery::Pending,
        });
        if !inserted {
            debug!(temp_id = %temp_id, "Optimistic entry already present");
        }
        Ok(())
    }

    /// Swap a pending entry for the server's copy.
    ///
    /// The confirmed message lands at its ordered position, which is the
    /// pending entry's slot unless the server timestamp moves it. If the
    /// broker echo already delivered the same id, the pending entry is just
    /// removed.
    pub fn confirm_optimistic(&mut self, temp_id: TempId, confirmed: Message) -> Result<()> {
        confirmed.validate()?;
        let active = self
            .active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?;
        let at = active
            .position(&MessageKey::Pending(temp_id))
            .ok_or_else(|| StoreError::NotFound {
                entity: "pending message",
                id: temp_id.to_string(),
            })?;

        active.messages.remove(at);
        let id = confirmed.id;
        if !active.insert_ordered(StoredMessage::confirmed(confirmed)) {
            debug!(temp_id = %temp_id, message = %id, "Echo arrived before confirmation");
        }
        Ok(())
    }

    /// Mark a pending entry as failed; it stays visible.
    pub fn mark_failed(&mut self, temp_id: TempId, reason: impl Into<String>) -> Result<()> {
        let entry = self.pending_entry_mut(temp_id)?;
        entry.delivery = Delivery::Failed {
            reason: reason.into(),
        };
        Ok(())
    }

    /// Put a failed entry back into `Pending` for a resend. Returns the
    /// recipient and body to send.
    pub fn retry_failed(&mut self, temp_id: TempId) -> Result<(UserId, String)> {
        let entry = self.pending_entry_mut(temp_id)?;
        if !entry.is_failed() {
            return Err(StoreError::NotFound {
                entity: "failed message",
                id: temp_id.to_string(),
            });
        }
        entry.delivery = Delivery::Pending;
        Ok((entry.recipient_id, entry.body.clone()))
    }

    /// Remove an unconfirmed entry (rollback after a failed send).
    pub fn discard_pending(&mut self, temp_id: TempId) -> Result<StoredMessage> {
        let active = self
            .active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?;
        let at = active
            .position(&MessageKey::Pending(temp_id))
            .ok_or_else(|| StoreError::NotFound {
                entity: "pending message",
                id: temp_id.to_string(),
            })?;
        Ok(active.messages.remove(at))
    }

    fn pending_entry_mut(&mut self, temp_id: TempId) -> Result<&mut StoredMessage> {
        self.active
            .as_mut()
            .ok_or(StoreError::NoActiveConversation)?
            .messages
            .iter_mut()
            .find(|m| m.key == MessageKey::Pending(temp_id))
            .ok_or_else(|| StoreError::NotFound {
                entity: "pending message",
                id: temp_id.to_string(),
            })
    }
}
