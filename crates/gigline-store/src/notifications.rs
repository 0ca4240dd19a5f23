//! Notification read state.

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use gigline_shared::protocol::Notification;
use gigline_shared::types::NotificationId;

use crate::error::{Result, StoreError};
use crate::models::ReadOutcome;

/// Known notifications keyed by id.
///
/// A read marker, once set, is never cleared: neither a batch refresh nor a
/// live push carrying `read_at: null` can make a read notification unread.
#[derive(Debug, Default)]
pub struct NotificationStore {
    entries: HashMap<NotificationId, Notification>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.entries.get(id)
    }

    /// Replace the whole set with a batch fetch.
    pub fn replace_all(&mut self, batch: Vec<Notification>) {
        let mut previous = std::mem::take(&mut self.entries);
        for mut notification in batch {
            if let Some(known) = previous.remove(&notification.id) {
                notification.read_at = merge_read_at(known.read_at, notification.read_at);
            }
            self.entries.insert(notification.id.clone(), notification);
        }
        debug!(count = self.entries.len(), "Notifications replaced");
    }

    /// Insert or refresh a single notification. Returns `true` if it was new.
    pub fn upsert(&mut self, mut notification: Notification) -> bool {
        match self.entries.get_mut(&notification.id) {
            Some(known) => {
                notification.read_at = merge_read_at(known.read_at, notification.read_at);
                *known = notification;
                false
            }
            None => {
                self.entries.insert(notification.id.clone(), notification);
                true
            }
        }
    }

    /// Set the read marker. Marking an already read notification keeps the
    /// first read time.
    pub fn mark_read(&mut self, id: &NotificationId, at: DateTime<Utc>) -> Result<ReadOutcome> {
        let entry = self.entries.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "notification",
            id: id.to_string(),
        })?;
        match entry.read_at {
            Some(read_at) => Ok(ReadOutcome::AlreadyRead(read_at)),
            None => {
                entry.read_at = Some(at);
                Ok(ReadOutcome::Marked(at))
            }
        }
    }

    /// Display order: newest first, ties broken by id descending.
    pub fn recent_first(&self) -> Vec<Notification> {
        let mut list: Vec<Notification> = self.entries.values().cloned().collect();
        list.sort_by_key(|n| Reverse((n.created_at, n.id.clone())));
        list
    }

    pub fn unread_count(&self) -> usize {
        self.entries.values().filter(|n| !n.is_read()).count()
    }
}

fn merge_read_at(
    known: Option<DateTime<Utc>>,
    incoming: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (known, incoming) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_739_865_600 + secs, 0).unwrap()
    }

    fn notification(id: &str, secs: i64) -> Notification {
        Notification {
            id: NotificationId::from(id),
            kind: "App\\Notifications\\NewMessage".into(),
            actor: "Ada".into(),
            message: format!("notification {id}"),
            created_at: at(secs),
            read_at: None,
        }
    }

    #[test]
    fn newer_notification_is_listed_first() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![notification("n1", 0), notification("n2", 60)]);

        let ids: Vec<_> = store.recent_first().into_iter().map(|n| n.id.0).collect();
        assert_eq!(ids, ["n2", "n1"]);
    }

    #[test]
    fn equal_timestamps_order_by_id_descending() {
        let mut store = NotificationStore::new();
        store.upsert(notification("a", 5));
        store.upsert(notification("b", 5));
        let ids: Vec<_> = store.recent_first().into_iter().map(|n| n.id.0).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn mark_read_is_monotonic() {
        let mut store = NotificationStore::new();
        store.upsert(notification("n1", 0));
        let id = NotificationId::from("n1");

        assert_eq!(store.mark_read(&id, at(10)).unwrap(), ReadOutcome::Marked(at(10)));
        assert_eq!(
            store.mark_read(&id, at(20)).unwrap(),
            ReadOutcome::AlreadyRead(at(10))
        );
        assert_eq!(store.get(&id).unwrap().read_at, Some(at(10)));
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn refresh_never_unsets_a_read_marker() {
        let mut store = NotificationStore::new();
        store.upsert(notification("n1", 0));
        let id = NotificationId::from("n1");
        store.mark_read(&id, at(10)).unwrap();

        store.replace_all(vec![notification("n1", 0)]);
        assert!(store.get(&id).unwrap().is_read());

        assert!(!store.upsert(notification("n1", 0)));
        assert_eq!(store.get(&id).unwrap().read_at, Some(at(10)));
    }

    #[test]
    fn replace_all_drops_notifications_missing_from_batch() {
        let mut store = NotificationStore::new();
        store.replace_all(vec![notification("n1", 0), notification("n2", 1)]);
        store.replace_all(vec![notification("n2", 1)]);
        assert_eq!(store.len(), 1);
        assert!(store.get(&NotificationId::from("n1")).is_none());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mut store = NotificationStore::new();
        let err = store
            .mark_read(&NotificationId::from("missing"), at(0))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "notification", .. }));
    }
}
