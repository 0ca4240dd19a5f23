//! Channel Subscription Manager.
//!
//! Opens one broker connection per session user, subscribed to that user's
//! private notification channel and the shared message channel. Opening is
//! idempotent and reference counted: repeated opens for the same user lease
//! the same connection, which is torn down when the last lease is closed or
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use gigline_shared::constants::{EVENT_QUEUE_CAPACITY, MESSAGE_SENT_CHANNEL};
use gigline_shared::protocol::ChannelEvent;
use gigline_shared::types::UserId;

use crate::auth::ChannelAuthorizer;
use crate::config::BrokerConfig;
use crate::connection::{self, ConnectionCommand, ConnectionShared};
use crate::error::Result;
use crate::transport::Connector;

/// Channels a session subscribes to, derived from the user id alone.
pub fn channel_names(user_id: UserId) -> Vec<String> {
    vec![user_id.private_channel(), MESSAGE_SENT_CHANNEL.to_string()]
}

struct RegistryEntry {
    shared: Arc<ConnectionShared>,
    leases: usize,
}

/// Open connections keyed by session user.
#[derive(Clone, Default)]
struct Registry {
    entries: Arc<Mutex<HashMap<UserId, RegistryEntry>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take another lease on a live connection, pruning a dead one.
    fn acquire(&self, user_id: UserId) -> Option<Arc<ConnectionShared>> {
        let mut entries = self.lock();
        match entries.get_mut(&user_id) {
            Some(entry) if entry.shared.is_alive() => {
                entry.leases += 1;
                Some(entry.shared.clone())
            }
            Some(_) => {
                debug!(user = %user_id, "Pruning finished connection");
                entries.remove(&user_id);
                None
            }
            None => None,
        }
    }

    fn insert(&self, shared: Arc<ConnectionShared>) {
        self.lock().insert(
            shared.user_id,
            RegistryEntry {
                shared,
                leases: 1,
            },
        );
    }

    fn release(&self, shared: &Arc<ConnectionShared>) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&shared.user_id) else {
            return;
        };
        if !Arc::ptr_eq(&entry.shared, shared) {
            return;
        }
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            entries.remove(&shared.user_id);
            let _ = shared.commands.send(ConnectionCommand::Shutdown);
            debug!(user = %shared.user_id, "Last lease released");
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn leases(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).map(|e| e.leases).unwrap_or(0)
    }
}

/// Queue of live events for the single active consumer of a connection.
pub struct EventStream {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl EventStream {
    /// Next event in receipt order, or `None` once the connection has ended
    /// or this consumer was replaced.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

/// One lease on an open broker connection.
///
/// Closing is idempotent and also happens on drop, so a view that owns its
/// handle releases the connection on teardown.
pub struct SubscriptionHandle {
    shared: Arc<ConnectionShared>,
    registry: Registry,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    pub fn socket_id(&self) -> &str {
        &self.shared.socket_id
    }

    pub fn channels(&self) -> &[String] {
        &self.shared.channels
    }

    /// Whether this lease is held and the connection task is still running.
    pub fn is_open(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.shared.is_alive()
    }

    /// Attach the event consumer.
    ///
    /// There is exactly one consumer per connection. Calling this again
    /// replaces the previous consumer: its stream ends and every later event
    /// goes to the new one, so no event is delivered twice.
    pub fn events(&self) -> EventStream {
        if let Some(rx) = self.shared.take_initial_events() {
            return EventStream { rx };
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        if self
            .shared
            .commands
            .send(ConnectionCommand::ReplaceSink(tx))
            .is_err()
        {
            debug!(user = %self.shared.user_id, "Connection already finished; stream is empty");
        }
        EventStream { rx }
    }

    /// Release this lease. Safe to call any number of times.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.release(&self.shared);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("user_id", &self.shared.user_id)
            .field("socket_id", &self.shared.socket_id)
            .field("channels", &self.shared.channels)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

pub struct SubscriptionManager {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    registry: Registry,
    /// Serialises opens so two concurrent opens for one user cannot both
    /// dial the broker.
    open_lock: tokio::sync::Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> Self {
        Self {
            config,
            connector,
            authorizer,
            registry: Registry::default(),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open (or lease the already open) connection for `user_id`.
    ///
    /// Fails with an authorization error if any channel is rejected and a
    /// connection error if the transport or handshake fails. Nothing is
    /// retried.
    pub async fn open(&self, user_id: UserId) -> Result<SubscriptionHandle> {
        let _guard = self.open_lock.lock().await;

        if let Some(shared) = self.registry.acquire(user_id) {
            debug!(user = %user_id, "Reusing open broker connection");
            return Ok(self.lease(shared));
        }

        let channels = channel_names(user_id);
        info!(user = %user_id, channels = ?channels, "Opening broker connection");

        // On any error below the transport is dropped, which closes it.
        let mut established =
            connection::handshake(self.connector.as_ref(), self.config.connect_timeout).await?;
        for channel in &channels {
            connection::subscribe_channel(
                &mut established,
                self.authorizer.as_ref(),
                channel,
                self.config.connect_timeout,
            )
            .await?;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let shared = Arc::new(ConnectionShared {
            user_id,
            socket_id: established.socket_id.clone(),
            channels,
            commands: cmd_tx,
            initial_events: Mutex::new(Some(event_rx)),
            alive: AtomicBool::new(true),
        });

        connection::spawn_event_loop(
            established,
            shared.clone(),
            event_tx,
            cmd_rx,
            self.config.pong_timeout,
        );

        self.registry.insert(shared.clone());
        Ok(SubscriptionHandle {
            shared,
            registry: self.registry.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Release a handle. Equivalent to [`SubscriptionHandle::close`].
    pub fn close(&self, handle: &SubscriptionHandle) {
        handle.close();
    }

    /// Number of users with an open connection.
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }

    /// Outstanding leases on `user_id`'s connection.
    pub fn leases(&self, user_id: UserId) -> usize {
        self.registry.leases(user_id)
    }

    fn lease(&self, shared: Arc<ConnectionShared>) -> SubscriptionHandle {
        SubscriptionHandle {
            shared,
            registry: self.registry.clone(),
            released: AtomicBool::new(false),
        }
    }
}
