//! Inbox orchestration.
//!
//! [`Inbox`] ties the conversation and notification stores to the dispatch
//! façade. Store locks are only ever taken between awaits, never across
//! one, so every store mutation is atomic with respect to the event loop.
//! Views subscribe to [`InboxEvent`]s and re-read the state they display.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use gigline_shared::protocol::{ChannelEvent, Message, Notification};
use gigline_shared::types::{ConnectionMode, NotificationId, TempId, UserId};
use gigline_store::{
    ConversationStore, IncomingOutcome, LoadPhase, NotificationStore, ReadOutcome,
    SnapshotOutcome, StoreError, StoredMessage,
};

use crate::api::Backend;
use crate::dispatch::MessageDispatch;
use crate::error::{ClientError, Result};
use crate::events::{emit_event, InboxEvent};
use crate::session::SessionContext;

const EVENT_BUFFER: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Inbox {
    session: SessionContext,
    dispatch: MessageDispatch,
    conversation: Mutex<ConversationStore>,
    notifications: Mutex<NotificationStore>,
    connection_mode: Mutex<ConnectionMode>,
    events: broadcast::Sender<InboxEvent>,
}

impl Inbox {
    pub fn new(session: SessionContext, backend: Arc<dyn Backend>) -> Arc<Self> {
        let dispatch = MessageDispatch::new(backend, &session);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            conversation: Mutex::new(ConversationStore::new(session.user_id)),
            notifications: Mutex::new(NotificationStore::new()),
            connection_mode: Mutex::new(ConnectionMode::Disconnected),
            session,
            dispatch,
            events,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn dispatch(&self) -> &MessageDispatch {
        &self.dispatch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InboxEvent) {
        emit_event(&self.events, event);
    }

    // -- read accessors -----------------------------------------------------

    pub fn active_correspondent(&self) -> Option<UserId> {
        lock(&self.conversation).active_correspondent()
    }

    pub fn phase(&self) -> LoadPhase {
        lock(&self.conversation).phase()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        lock(&self.conversation).messages().to_vec()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.conversation).last_error().map(str::to_string)
    }

    pub fn unread_count(&self, correspondent: UserId) -> usize {
        lock(&self.conversation).unread_count(correspondent)
    }

    pub fn total_unread(&self) -> usize {
        lock(&self.conversation).total_unread()
    }

    /// Notifications in display order, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).recent_first()
    }

    pub fn unread_notifications(&self) -> usize {
        lock(&self.notifications).unread_count()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        lock(&self.connection_mode).clone()
    }

    pub(crate) fn set_connection_mode(&self, mode: ConnectionMode, reason: Option<String>) {
        {
            let mut current = lock(&self.connection_mode);
            if *current == mode {
                return;
            }
            *current = mode.clone();
        }
        info!(mode = ?mode, reason = ?reason, "Connection mode changed");
        self.emit(InboxEvent::ConnectionModeChanged { mode, reason });
    }

    // -- conversation -------------------------------------------------------

    /// Switch the active conversation. Returns `false` if `correspondent`
    /// was already active.
    pub fn select_correspondent(&self, correspondent: UserId) -> bool {
        let (changed, had_unread) = {
            let mut store = lock(&self.conversation);
            let had_unread = store.unread_count(correspondent) > 0;
            (store.select(correspondent), had_unread)
        };
        if changed {
            self.emit(InboxEvent::ConversationChanged { correspondent });
            if had_unread {
                self.emit(InboxEvent::UnreadChanged {
                    correspondent,
                    count: 0,
                });
            }
        }
        changed
    }

    /// Fetch and apply the history of the active conversation.
    ///
    /// Resolves to `Stale` when the selection changed while the fetch was
    /// in flight; its result (or failure) is discarded.
    pub async fn load_snapshot(&self) -> Result<SnapshotOutcome> {
        let ticket = lock(&self.conversation).begin_load()?;
        let correspondent = ticket.correspondent();
        self.emit(InboxEvent::ConversationChanged { correspondent });

        match self.dispatch.fetch_history(correspondent).await {
            Ok(history) => {
                let outcome = lock(&self.conversation).apply_snapshot(&ticket, history)?;
                if let SnapshotOutcome::Applied { .. } = outcome {
                    self.emit(InboxEvent::ConversationChanged { correspondent });
                }
                Ok(outcome)
            }
            Err(e) => {
                let current = lock(&self.conversation).fail_load(&ticket, e.to_string());
                if !current {
                    debug!(correspondent = %correspondent, error = %e, "Ignoring failure of stale fetch");
                    return Ok(SnapshotOutcome::Stale);
                }
                self.emit(InboxEvent::ConversationChanged { correspondent });
                Err(e)
            }
        }
    }

    /// Select `correspondent` and load its history.
    pub async fn open_conversation(&self, correspondent: UserId) -> Result<SnapshotOutcome> {
        self.select_correspondent(correspondent);
        self.load_snapshot().await
    }

    /// Send `body` to the active correspondent.
    ///
    /// The message shows up immediately as pending. On success it is
    /// replaced by the server's copy; on failure it stays visible as failed
    /// and the returned error carries its temporary id for
    /// [`retry_failed`](Self::retry_failed) or
    /// [`discard_failed`](Self::discard_failed).
    pub async fn send_message(&self, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyBody);
        }
        let temp_id = TempId::new();
        let recipient = {
            let mut store = lock(&self.conversation);
            let recipient = store
                .active_correspondent()
                .ok_or(StoreError::NoActiveConversation)?;
            store.append_optimistic(temp_id, body)?;
            recipient
        };
        self.emit(InboxEvent::ConversationChanged {
            correspondent: recipient,
        });
        self.deliver(temp_id, recipient, body).await
    }

    /// Resend a failed message under its original temporary id.
    pub async fn retry_failed(&self, temp_id: TempId) -> Result<Message> {
        let (recipient, body) = lock(&self.conversation).retry_failed(temp_id)?;
        self.emit(InboxEvent::ConversationChanged {
            correspondent: recipient,
        });
        self.deliver(temp_id, recipient, &body).await
    }

    /// Drop a failed (or abandoned pending) message from the view.
    pub fn discard_failed(&self, temp_id: TempId) -> Result<()> {
        let removed = lock(&self.conversation).discard_pending(temp_id)?;
        self.emit(InboxEvent::ConversationChanged {
            correspondent: removed.recipient_id,
        });
        Ok(())
    }

    async fn deliver(&self, temp_id: TempId, recipient: UserId, body: &str) -> Result<Message> {
        match self.dispatch.send(recipient, body).await {
            Ok(message) => {
                let confirmed = lock(&self.conversation).confirm_optimistic(temp_id, message.clone());
                match confirmed {
                    Ok(()) => self.emit(InboxEvent::ConversationChanged {
                        correspondent: recipient,
                    }),
                    // The user switched away; the message appears on the
                    // next load.
                    Err(e) => debug!(temp_id = %temp_id, error = %e, "Confirmed message no longer displayed"),
                }
                Ok(message)
            }
            Err(e) => {
                let reason = e.to_string();
                let marked = lock(&self.conversation).mark_failed(temp_id, reason.clone());
                if let Err(store_err) = marked {
                    debug!(temp_id = %temp_id, error = %store_err, "Failed message no longer displayed");
                }
                warn!(recipient = %recipient, temp_id = %temp_id, error = %e, "Send failed");
                self.emit(InboxEvent::SendFailed {
                    temp_id,
                    reason: reason.clone(),
                });
                Err(match e {
                    ClientError::Send { recipient, reason, .. } => ClientError::Send {
                        recipient,
                        temp_id: Some(temp_id),
                        reason,
                    },
                    other => other,
                })
            }
        }
    }

    // -- notifications ------------------------------------------------------

    /// Refetch every notification of the session user. Returns the unread
    /// count.
    pub async fn refresh_notifications(&self) -> Result<usize> {
        let batch = self
            .dispatch
            .fetch_notifications(self.session.user_id)
            .await?;
        let unread = {
            let mut store = lock(&self.notifications);
            store.replace_all(batch);
            store.unread_count()
        };
        self.emit(InboxEvent::NotificationsChanged { unread });
        Ok(unread)
    }

    /// Mark a notification read, recording the server's read time.
    ///
    /// Already read notifications are not sent to the server again.
    pub async fn mark_notification_read(&self, id: &NotificationId) -> Result<ReadOutcome> {
        {
            let store = lock(&self.notifications);
            let known = store.get(id).ok_or_else(|| StoreError::NotFound {
                entity: "notification",
                id: id.to_string(),
            })?;
            if let Some(read_at) = known.read_at {
                return Ok(ReadOutcome::AlreadyRead(read_at));
            }
        }

        let read_at = self.dispatch.mark_read(id).await?;
        let (outcome, unread) = {
            let mut store = lock(&self.notifications);
            let outcome = store.mark_read(id, read_at)?;
            (outcome, store.unread_count())
        };
        if let ReadOutcome::Marked(_) = outcome {
            self.emit(InboxEvent::NotificationsChanged { unread });
        }
        Ok(outcome)
    }

    // -- live events --------------------------------------------------------

    /// Merge one live event. Events must be applied in receipt order.
    pub fn apply_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageSent { message } => {
                let id = message.id;
                let outcome = lock(&self.conversation).append_incoming(message);
                match outcome {
                    Ok(IncomingOutcome::Appended) => {
                        if let Some(correspondent) = self.active_correspondent() {
                            self.emit(InboxEvent::ConversationChanged { correspondent });
                        }
                    }
                    Ok(IncomingOutcome::Unread {
                        correspondent,
                        count,
                    }) => self.emit(InboxEvent::UnreadChanged {
                        correspondent,
                        count,
                    }),
                    Ok(IncomingOutcome::Duplicate | IncomingOutcome::Foreign) => {}
                    Err(e) => warn!(message = %id, error = %e, "Dropping live message"),
                }
            }
            ChannelEvent::NotificationCreated { notification } => {
                let unread = {
                    let mut store = lock(&self.notifications);
                    store.upsert(notification);
                    store.unread_count()
                };
                self.emit(InboxEvent::NotificationsChanged { unread });
            }
            ChannelEvent::Disconnected { reason } => {
                self.set_connection_mode(ConnectionMode::Disconnected, Some(reason.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gigline_shared::error::ErrorKind;
    use gigline_shared::protocol::DisconnectReason;
    use gigline_shared::types::MessageId;
    use gigline_store::{Delivery, MessageKey};

    use super::*;
    use crate::api::ApiError;
    use crate::test_helpers::{at, message, notification, MockBackend, ADA, BOB, ME};

    fn inbox(backend: Arc<MockBackend>) -> Arc<Inbox> {
        Inbox::new(SessionContext::new(ME, "Me", "token"), backend)
    }

    fn ids(inbox: &Inbox) -> Vec<String> {
        inbox.messages().iter().map(|m| m.key.to_string()).collect()
    }

    #[tokio::test]
    async fn send_then_echo_leaves_one_confirmed_entry() {
        let backend = MockBackend::new(ME);
        let inbox = inbox(backend);
        inbox.open_conversation(ADA).await.unwrap();

        let sent = inbox.send_message("hi").await.unwrap();
        assert_eq!(sent.id, MessageId(1001));

        inbox.apply_event(ChannelEvent::MessageSent {
            message: sent.clone(),
        });

        let messages = inbox.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, MessageKey::Confirmed(MessageId(1001)));
        assert_eq!(messages[0].body, "hi");
        assert_eq!(messages[0].delivery, Delivery::Confirmed);
    }

    #[tokio::test]
    async fn echo_before_confirmation_is_not_duplicated() {
        let backend = MockBackend::new(ME);
        let gate = backend.gate_sends();
        let inbox = inbox(backend);
        inbox.open_conversation(ADA).await.unwrap();

        let sender = inbox.clone();
        let send = tokio::spawn(async move { sender.send_message("hi").await });

        // Wait for the optimistic entry, then deliver the echo first.
        tokio::time::timeout(Duration::from_secs(2), async {
            while inbox.messages().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        inbox.apply_event(ChannelEvent::MessageSent {
            message: Message {
                id: MessageId(1001),
                conversation_id: None,
                sender_id: ME,
                recipient_id: ADA,
                content: "hi".into(),
                created_at: at(0),
            },
        });
        gate.notify_one();
        send.await.unwrap().unwrap();

        assert_eq!(ids(&inbox), ["1001"]);
    }

    #[tokio::test]
    async fn late_snapshot_for_previous_correspondent_is_discarded() {
        let backend = MockBackend::new(ME);
        backend.set_history(ADA, vec![message(1, ADA, ME, 1)]);
        backend.set_history(BOB, vec![message(9, BOB, ME, 5)]);
        let gate = backend.gate_history(ADA);
        let inbox = inbox(backend);

        let loader = inbox.clone();
        let ada_load = tokio::spawn(async move { loader.open_conversation(ADA).await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while inbox.phase() != LoadPhase::Loading {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let bob = inbox.open_conversation(BOB).await.unwrap();
        assert_eq!(bob, SnapshotOutcome::Applied { count: 1 });

        gate.notify_one();
        let ada = ada_load.await.unwrap().unwrap();
        assert_eq!(ada, SnapshotOutcome::Stale);
        assert_eq!(inbox.active_correspondent(), Some(BOB));
        assert_eq!(ids(&inbox), ["9"]);
    }

    #[tokio::test]
    async fn failed_load_reports_fetch_error_and_applies_nothing() {
        let backend = MockBackend::new(ME);
        backend.fail_history(ADA, ApiError::Status {
            status: 502,
            body: "Bad Gateway".into(),
        });
        let inbox = inbox(backend);

        let err = inbox.open_conversation(ADA).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert_eq!(inbox.phase(), LoadPhase::Empty);
        assert!(inbox.messages().is_empty());
        assert!(inbox.last_error().is_some());
    }

    #[tokio::test]
    async fn failed_send_stays_visible_and_can_be_retried() {
        let backend = MockBackend::new(ME);
        backend.fail_next_send(ApiError::Status {
            status: 500,
            body: "Server Error".into(),
        });
        let inbox = inbox(backend);
        let mut events = inbox.subscribe();
        inbox.open_conversation(ADA).await.unwrap();

        let err = inbox.send_message("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Send);
        let temp_id = match err {
            ClientError::Send {
                temp_id: Some(temp_id),
                ..
            } => temp_id,
            other => panic!("unexpected error: {other:?}"),
        };

        let messages = inbox.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_failed());
        assert_eq!(messages[0].temp_id(), Some(temp_id));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, InboxEvent::SendFailed { temp_id: t, .. } if t == temp_id);
        }
        assert!(saw_failure);

        let sent = inbox.retry_failed(temp_id).await.unwrap();
        assert_eq!(ids(&inbox), [sent.id.to_string()]);
    }

    #[tokio::test]
    async fn failed_send_can_be_discarded() {
        let backend = MockBackend::new(ME);
        backend.fail_next_send(ApiError::Timeout);
        let inbox = inbox(backend);
        inbox.open_conversation(ADA).await.unwrap();

        let temp_id = match inbox.send_message("hello").await {
            Err(ClientError::Send {
                temp_id: Some(t), ..
            }) => t,
            other => panic!("unexpected result: {other:?}"),
        };
        inbox.discard_failed(temp_id).unwrap();
        assert!(inbox.messages().is_empty());
    }

    #[tokio::test]
    async fn send_without_selection_fails() {
        let inbox = inbox(MockBackend::new(ME));
        let err = inbox.send_message("hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn message_for_other_conversation_bumps_unread() {
        let backend = MockBackend::new(ME);
        let inbox = inbox(backend);
        inbox.open_conversation(ADA).await.unwrap();

        inbox.apply_event(ChannelEvent::MessageSent {
            message: message(5, BOB, ME, 1),
        });
        assert!(inbox.messages().is_empty());
        assert_eq!(inbox.unread_count(BOB), 1);

        inbox.open_conversation(BOB).await.unwrap();
        assert_eq!(inbox.unread_count(BOB), 0);
    }

    #[tokio::test]
    async fn notifications_display_newest_first_and_read_is_monotonic() {
        let backend = MockBackend::new(ME);
        backend.set_notifications(vec![notification("T1", 0), notification("T2", 60)]);
        backend.set_read_time(Some(at(100)));
        let inbox = inbox(backend.clone());

        assert_eq!(inbox.refresh_notifications().await.unwrap(), 2);
        let shown: Vec<_> = inbox.notifications().into_iter().map(|n| n.id.0).collect();
        assert_eq!(shown, ["T2", "T1"]);

        let id = NotificationId::from("T1");
        let first = inbox.mark_notification_read(&id).await.unwrap();
        assert_eq!(first, ReadOutcome::Marked(at(100)));

        backend.set_read_time(Some(at(200)));
        let second = inbox.mark_notification_read(&id).await.unwrap();
        assert_eq!(second, ReadOutcome::AlreadyRead(at(100)));
        assert_eq!(backend.mark_read_calls(), 1);

        // A refresh reporting it unread does not undo the read.
        inbox.refresh_notifications().await.unwrap();
        assert_eq!(inbox.unread_notifications(), 1);
    }

    #[tokio::test]
    async fn unknown_notification_is_not_found() {
        let inbox = inbox(MockBackend::new(ME));
        let err = inbox
            .mark_notification_read(&NotificationId::from("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn pushed_notification_is_added_unread() {
        let inbox = inbox(MockBackend::new(ME));
        let mut events = inbox.subscribe();
        inbox.apply_event(ChannelEvent::NotificationCreated {
            notification: notification("T3", 5),
        });
        assert_eq!(inbox.unread_notifications(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            InboxEvent::NotificationsChanged { unread: 1 }
        );
    }

    #[tokio::test]
    async fn disconnect_is_reported_once() {
        let inbox = inbox(MockBackend::new(ME));
        inbox.set_connection_mode(ConnectionMode::Connected, None);
        let mut events = inbox.subscribe();

        for _ in 0..2 {
            inbox.apply_event(ChannelEvent::Disconnected {
                reason: DisconnectReason::ActivityTimeout,
            });
        }
        assert_eq!(inbox.connection_mode(), ConnectionMode::Disconnected);
        assert!(matches!(
            events.try_recv().unwrap(),
            InboxEvent::ConnectionModeChanged {
                mode: ConnectionMode::Disconnected,
                ..
            }
        ));
        assert!(events.try_recv().is_err());
    }
}
