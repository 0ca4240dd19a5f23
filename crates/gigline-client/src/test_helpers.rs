//! In-memory backend and fixtures shared by the crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use gigline_shared::protocol::{Message, Notification};
use gigline_shared::types::{MessageId, NotificationId, UserId};

use crate::api::{ApiError, ApiResult, Backend, ConversationSummary, UserPage, UserRecord};

pub const ME: UserId = UserId(7);
pub const ADA: UserId = UserId(42);
pub const BOB: UserId = UserId(43);

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_739_865_600 + secs, 0).unwrap()
}

pub fn message(id: u64, sender: UserId, recipient: UserId, secs: i64) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: None,
        sender_id: sender,
        recipient_id: recipient,
        content: format!("message {id}"),
        created_at: at(secs),
    }
}

pub fn notification(id: &str, secs: i64) -> Notification {
    Notification {
        id: NotificationId::from(id),
        kind: "App\\Notifications\\NewMessage".into(),
        actor: "Ada".into(),
        message: "sent you a message".into(),
        created_at: at(secs),
        read_at: None,
    }
}

pub struct MockBackend {
    local_user: UserId,
    history: Mutex<HashMap<UserId, ApiResult<Vec<Message>>>>,
    history_gates: Mutex<HashMap<UserId, Arc<Notify>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    send_failures: Mutex<VecDeque<ApiError>>,
    next_message_id: AtomicU64,
    sends: AtomicUsize,
    notifications: Mutex<Vec<Notification>>,
    read_time: Mutex<Option<DateTime<Utc>>>,
    mark_read_calls: AtomicUsize,
    users: Mutex<Vec<UserRecord>>,
}

impl MockBackend {
    pub fn new(local_user: UserId) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            history: Mutex::new(HashMap::new()),
            history_gates: Mutex::new(HashMap::new()),
            send_gate: Mutex::new(None),
            send_failures: Mutex::new(VecDeque::new()),
            next_message_id: AtomicU64::new(1001),
            sends: AtomicUsize::new(0),
            notifications: Mutex::new(Vec::new()),
            read_time: Mutex::new(None),
            mark_read_calls: AtomicUsize::new(0),
            users: Mutex::new(Vec::new()),
        })
    }

    pub fn set_history(&self, correspondent: UserId, messages: Vec<Message>) {
        self.history.lock().unwrap().insert(correspondent, Ok(messages));
    }

    pub fn fail_history(&self, correspondent: UserId, error: ApiError) {
        self.history.lock().unwrap().insert(correspondent, Err(error));
    }

    /// Hold the next history fetch for `correspondent` until the returned
    /// gate is notified.
    pub fn gate_history(&self, correspondent: UserId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(correspondent, gate.clone());
        gate
    }

    /// Hold the next send until the returned gate is notified.
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_next_send(&self, error: ApiError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        *self.notifications.lock().unwrap() = notifications;
    }

    pub fn set_read_time(&self, at: Option<DateTime<Utc>>) {
        *self.read_time.lock().unwrap() = at;
    }

    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }

    pub fn set_users(&self, users: Vec<UserRecord>) {
        *self.users.lock().unwrap() = users;
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn history(&self, correspondent: UserId) -> ApiResult<Vec<Message>> {
        let gate = self.history_gates.lock().unwrap().remove(&correspondent);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.history
            .lock()
            .unwrap()
            .get(&correspondent)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(&self, recipient: UserId, content: &str) -> ApiResult<Message> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let gate = self.send_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(Message {
            id: MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)),
            conversation_id: None,
            sender_id: self.local_user,
            recipient_id: recipient,
            content: content.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn notifications(&self, _user: UserId) -> ApiResult<Vec<Notification>> {
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn mark_notification_read(
        &self,
        _id: &NotificationId,
    ) -> ApiResult<Option<DateTime<Utc>>> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.read_time.lock().unwrap())
    }

    async fn users(&self, _page: u32) -> ApiResult<UserPage> {
        Ok(UserPage {
            users: self.users.lock().unwrap().clone(),
            last_page: 1,
        })
    }

    async fn conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        Ok(Vec::new())
    }
}
