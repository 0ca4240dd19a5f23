//! Bridge from a broker subscription into the inbox.
//!
//! One task drains the subscription's event stream and applies each event
//! to the [`Inbox`] in receipt order. The bridge never reconnects: once the
//! connection drops, the inbox reports `Disconnected` and reopening is up to
//! the caller.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gigline_net::{
    EventStream, HttpChannelAuthorizer, SubscriptionHandle, SubscriptionManager,
    WebSocketConnector,
};
use gigline_shared::types::ConnectionMode;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::inbox::Inbox;
use crate::session::SessionContext;

/// Subscription manager wired to the real broker and auth endpoint.
pub fn subscription_manager(
    config: &ClientConfig,
    session: &SessionContext,
) -> Result<SubscriptionManager> {
    let broker = config.broker_config()?;
    let connector = WebSocketConnector::new(&broker);
    let authorizer =
        HttpChannelAuthorizer::new(&config.api_base, session.api_token(), config.request_timeout)?;
    Ok(SubscriptionManager::new(
        broker,
        Arc::new(connector),
        Arc::new(authorizer),
    ))
}

/// Apply every event of `events` to `inbox` until the stream ends.
pub async fn run_event_bridge(inbox: Arc<Inbox>, mut events: EventStream) {
    info!(user = %inbox.session().user_id, "Live event bridge started");
    inbox.set_connection_mode(ConnectionMode::Connected, None);

    while let Some(event) = events.recv().await {
        debug!(event = event.name(), "Live event received");
        inbox.apply_event(event);
    }

    warn!("Live event bridge ended");
}

/// Attach to `handle`'s events and bridge them on a new task.
pub fn spawn_event_bridge(inbox: Arc<Inbox>, handle: &SubscriptionHandle) -> JoinHandle<()> {
    let events = handle.events();
    tokio::spawn(run_event_bridge(inbox, events))
}

/// Live updates for one inbox: the subscription lease plus its bridge task.
///
/// Dropping it closes the lease and stops the bridge.
pub struct LiveUpdates {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl LiveUpdates {
    /// Open the session user's channels and start bridging into `inbox`.
    pub async fn start(inbox: Arc<Inbox>, manager: &SubscriptionManager) -> Result<Self> {
        let user_id = inbox.session().user_id;
        let handle = manager.open(user_id).await?;
        info!(user = %user_id, socket_id = %handle.socket_id(), "Live updates started");
        let task = spawn_event_bridge(inbox, &handle);
        Ok(Self { handle, task })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_open() && !self.task.is_finished()
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for LiveUpdates {
    fn drop(&mut self) {
        self.task.abort();
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use gigline_net::{
        BrokerConfig, ChannelAuth, ChannelAuthorizer, Connector, FrameStream, NetError,
        TransportFrame,
    };
    use gigline_shared::types::MessageId;
    use gigline_store::MessageKey;

    use super::*;
    use crate::test_helpers::{MockBackend, ADA, ME};

    const WAIT: Duration = Duration::from_secs(2);

    /// Broker that greets, acknowledges every subscribe, and then forwards
    /// whatever the test pushes.
    struct OneShotConnector {
        stream: Mutex<Option<FrameStream>>,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self) -> gigline_net::Result<FrameStream> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| NetError::Connection("connection refused".into()))
        }
    }

    struct AllowAll;

    #[async_trait]
    impl ChannelAuthorizer for AllowAll {
        async fn authorize(
            &self,
            _socket_id: &str,
            channel_name: &str,
        ) -> gigline_net::Result<ChannelAuth> {
            Ok(ChannelAuth {
                auth: format!("key:{channel_name}"),
                channel_data: None,
            })
        }
    }

    fn broker() -> (OneShotConnector, mpsc::Sender<TransportFrame>) {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(64);
        in_tx
            .try_send(TransportFrame::Text(
                r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"1.2\",\"activity_timeout\":120}"}"#
                    .into(),
            ))
            .unwrap();

        let replies = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if frame["event"] == "pusher:subscribe" {
                    let channel = frame["data"]["channel"].as_str().unwrap().to_string();
                    let ack = format!(
                        r#"{{"event":"pusher_internal:subscription_succeeded","channel":"{channel}","data":"{{}}"}}"#
                    );
                    let _ = replies.send(TransportFrame::Text(ack)).await;
                }
            }
        });

        let connector = OneShotConnector {
            stream: Mutex::new(Some(FrameStream {
                outgoing: out_tx,
                incoming: in_rx,
            })),
        };
        (connector, in_tx)
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn echo_of_own_send_is_merged_once_and_drop_is_reported() {
        let (connector, to_client) = broker();
        let manager = SubscriptionManager::new(
            BrokerConfig::for_cluster("key", "ap1"),
            Arc::new(connector),
            Arc::new(AllowAll),
        );
        let inbox = Inbox::new(SessionContext::new(ME, "Me", "token"), MockBackend::new(ME));
        inbox.open_conversation(ADA).await.unwrap();

        let live = LiveUpdates::start(inbox.clone(), &manager).await.unwrap();
        assert!(live.is_running());
        assert_eq!(inbox.connection_mode(), ConnectionMode::Connected);

        let sent = inbox.send_message("hi").await.unwrap();
        assert_eq!(sent.id, MessageId(1001));

        let echo = format!(
            r#"{{"event":"App\\Events\\MessageSent","channel":"private-message.sent","data":{{"data":{}}}}}"#,
            serde_json::to_string(&sent).unwrap()
        );
        to_client.send(TransportFrame::Text(echo)).await.unwrap();
        to_client
            .send(TransportFrame::Text(
                r#"{"event":"Illuminate\\Notifications\\Events\\BroadcastNotificationCreated","channel":"private-App.Models.User.7","data":{"id":"n1","type":"App\\Notifications\\NewMessage","user":"Ada","message":"sent you a message"}}"#
                    .into(),
            ))
            .await
            .unwrap();

        // Events apply in order, so once the notification is in, so is the echo.
        eventually("notification", || inbox.unread_notifications() == 1).await;
        let keys: Vec<_> = inbox.messages().iter().map(|m| m.key).collect();
        assert_eq!(keys, [MessageKey::Confirmed(MessageId(1001))]);

        to_client
            .send(TransportFrame::Closed {
                code: Some(4200),
                reason: "reconnect".into(),
            })
            .await
            .unwrap();
        eventually("disconnect", || {
            inbox.connection_mode() == ConnectionMode::Disconnected
        })
        .await;
        eventually("bridge exit", || !live.is_running()).await;
    }
}
