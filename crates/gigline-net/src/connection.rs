//! Broker connection task with tokio mpsc command/event pattern.
//!
//! Opening a connection is a sequence of awaited steps (socket, handshake,
//! one auth + subscribe per channel). Once every channel is confirmed the
//! connection moves into a dedicated tokio task. External code talks to it
//! through a command channel and receives typed [`ChannelEvent`]s on a
//! single event queue, in the order the transport delivered them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gigline_shared::constants::DEFAULT_ACTIVITY_TIMEOUT_SECS;
use gigline_shared::protocol::{ChannelEvent, DisconnectReason};
use gigline_shared::types::UserId;

use crate::auth::ChannelAuthorizer;
use crate::error::{NetError, Result};
use crate::frames::{decode, Inbound, PusherFrame};
use crate::transport::{Connector, FrameStream, TransportFrame};

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Route all further events to a new consumer; the previous queue ends.
    ReplaceSink(mpsc::Sender<ChannelEvent>),
    /// Unsubscribe every channel and close the socket.
    Shutdown,
}

/// State shared between the connection task and the handles leasing it.
pub(crate) struct ConnectionShared {
    pub(crate) user_id: UserId,
    pub(crate) socket_id: String,
    pub(crate) channels: Vec<String>,
    pub(crate) commands: mpsc::UnboundedSender<ConnectionCommand>,
    /// Receiver created at open time, handed to the first consumer.
    pub(crate) initial_events: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    pub(crate) alive: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn take_initial_events(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.initial_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// A transport that completed the broker handshake.
pub(crate) struct Established {
    pub(crate) socket_id: String,
    pub(crate) activity_timeout: Duration,
    pub(crate) stream: FrameStream,
    /// Application events that arrived while later channels were still
    /// being subscribed.
    pub(crate) backlog: Vec<ChannelEvent>,
}

impl Established {
    async fn send(&self, frame: PusherFrame) -> Result<()> {
        let text = frame.to_text()?;
        self.stream
            .outgoing
            .send(text)
            .await
            .map_err(|_| NetError::Connection("transport closed".to_string()))
    }

    /// Wait for the next decodable frame before `deadline`, answering pings
    /// and stashing application events along the way.
    async fn next_control(&mut self, deadline: Instant, stage: &'static str) -> Result<Inbound> {
        loop {
            let frame = tokio::time::timeout_at(deadline, self.stream.incoming.recv())
                .await
                .map_err(|_| NetError::Timeout { stage })?;

            let text = match frame {
                Some(TransportFrame::Text(text)) => text,
                Some(TransportFrame::Closed { code, reason }) => {
                    return Err(NetError::Connection(format!(
                        "broker closed the socket during {stage} ({code:?}): {reason}"
                    )));
                }
                Some(TransportFrame::Error(e)) => return Err(NetError::Connection(e)),
                None => {
                    return Err(NetError::Connection(format!(
                        "transport ended during {stage}"
                    )))
                }
            };

            match decode(&text) {
                Ok(Inbound::Ping) => self.send(PusherFrame::pong()).await?,
                Ok(Inbound::Event(event)) => self.backlog.push(event),
                Ok(Inbound::Ignored { event }) => debug!(event = %event, "Ignoring frame"),
                Ok(other) => return Ok(other),
                Err(e) => warn!(error = %e, stage, "Dropping undecodable frame"),
            }
        }
    }
}

/// Connect and wait for `pusher:connection_established`.
pub(crate) async fn handshake(
    connector: &dyn Connector,
    connect_timeout: Duration,
) -> Result<Established> {
    let deadline = Instant::now() + connect_timeout;
    let stream = tokio::time::timeout_at(deadline, connector.connect())
        .await
        .map_err(|_| NetError::Timeout {
            stage: "transport connect",
        })??;

    let mut established = Established {
        socket_id: String::new(),
        activity_timeout: Duration::from_secs(DEFAULT_ACTIVITY_TIMEOUT_SECS),
        stream,
        backlog: Vec::new(),
    };

    loop {
        match established.next_control(deadline, "handshake").await? {
            Inbound::ConnectionEstablished {
                socket_id,
                activity_timeout,
            } => {
                established.socket_id = socket_id;
                if let Some(secs) = activity_timeout {
                    established.activity_timeout = Duration::from_secs(secs);
                }
                debug!(socket_id = %established.socket_id, "Broker handshake complete");
                return Ok(established);
            }
            Inbound::Error { code, message } => {
                return Err(NetError::Connection(format!(
                    "broker refused connection ({code:?}): {message}"
                )));
            }
            other => debug!(frame = ?other, "Unexpected frame before handshake"),
        }
    }
}

/// Authorize and subscribe a single private channel. Exactly one auth call
/// is made; its failure is returned as is.
pub(crate) async fn subscribe_channel(
    established: &mut Established,
    authorizer: &dyn ChannelAuthorizer,
    channel: &str,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let auth = tokio::time::timeout_at(
        deadline,
        authorizer.authorize(&established.socket_id, channel),
    )
    .await
    .map_err(|_| NetError::Timeout {
        stage: "channel authorization",
    })??;

    established
        .send(PusherFrame::subscribe(
            channel,
            &auth.auth,
            auth.channel_data.as_deref(),
        ))
        .await?;

    loop {
        match established.next_control(deadline, "channel subscription").await? {
            Inbound::SubscriptionSucceeded { channel: ch } if ch == channel => {
                info!(channel = %channel, "Subscribed to channel");
                return Ok(());
            }
            Inbound::SubscriptionError {
                channel: ch,
                status,
                message,
            } if ch == channel || ch.is_empty() => {
                return Err(match status {
                    Some(401) | Some(403) => NetError::Authorization {
                        channel: channel.to_string(),
                        reason: message,
                    },
                    _ => NetError::Connection(format!(
                        "subscription to {channel} failed ({status:?}): {message}"
                    )),
                });
            }
            Inbound::Error { code, message } => {
                return Err(NetError::Connection(format!(
                    "broker error while subscribing {channel} ({code:?}): {message}"
                )));
            }
            other => debug!(frame = ?other, "Unrelated frame during subscription"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Events held by the task beyond the consumer queue before the oldest
/// are dropped.
const MAX_UNDELIVERED_EVENTS: usize = 4096;

/// Queue `event` for the consumer. Delivery happens in the event loop as
/// room frees up, so a slow or absent consumer never stalls the transport
/// or command handling.
fn enqueue(undelivered: &mut VecDeque<ChannelEvent>, event: ChannelEvent) {
    if undelivered.len() >= MAX_UNDELIVERED_EVENTS {
        if let Some(dropped) = undelivered.pop_front() {
            warn!(event = dropped.name(), "Event consumer is not keeping up; oldest event dropped");
        }
    }
    undelivered.push_back(event);
}

async fn send_frame(stream: &FrameStream, frame: PusherFrame) -> bool {
    match frame.to_text() {
        Ok(text) => stream.outgoing.send(text).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to encode frame");
            false
        }
    }
}

/// Spawn the connection task. Backlogged events are delivered first, then
/// live frames in transport order. The task never reconnects: a dropped
/// transport produces one `Disconnected` event and the task ends.
pub(crate) fn spawn_event_loop(
    established: Established,
    shared: Arc<ConnectionShared>,
    sink: mpsc::Sender<ChannelEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    pong_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Established {
            activity_timeout,
            mut stream,
            backlog,
            ..
        } = established;
        let mut sink = sink;
        let mut undelivered: VecDeque<ChannelEvent> = backlog.into();
        let mut awaiting_pong = false;
        // Set once the transport is gone; the task lingers only to hand over
        // what is still queued, ending with the `Disconnected` event.
        let mut transport_done = false;

        loop {
            if transport_done && undelivered.is_empty() {
                break;
            }
            let idle = if awaiting_pong {
                pong_timeout
            } else {
                activity_timeout
            };

            let mut replaced_sink = None;
            tokio::select! {
                // --- Incoming commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::ReplaceSink(new_sink)) => {
                            debug!(user = %shared.user_id, "Event consumer replaced");
                            replaced_sink = Some(new_sink);
                        }
                        Some(ConnectionCommand::Shutdown) | None => {
                            info!(user = %shared.user_id, "Closing broker connection");
                            if !transport_done {
                                for channel in &shared.channels {
                                    send_frame(&stream, PusherFrame::unsubscribe(channel)).await;
                                }
                            }
                            drop(shared.take_initial_events());
                            break;
                        }
                    }
                }

                // --- Delivery to the consumer ---
                permit = sink.reserve(), if !undelivered.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = undelivered.pop_front() {
                                permit.send(event);
                            }
                        }
                        Err(_) => {
                            warn!(dropped = undelivered.len(), "No event consumer attached; events dropped");
                            undelivered.clear();
                        }
                    }
                }

                // --- Transport frames ---
                frame = tokio::time::timeout(idle, stream.incoming.recv()), if !transport_done => {
                    let ended = match frame {
                        Err(_) if awaiting_pong => {
                            warn!(user = %shared.user_id, "Broker did not answer ping");
                            Some(DisconnectReason::ActivityTimeout)
                        }
                        Err(_) => {
                            debug!("Connection idle, pinging broker");
                            send_frame(&stream, PusherFrame::ping()).await;
                            awaiting_pong = true;
                            None
                        }
                        Ok(Some(TransportFrame::Text(text))) => {
                            awaiting_pong = false;
                            match decode(&text) {
                                Ok(Inbound::Event(event)) => {
                                    debug!(event = event.name(), "Live event received");
                                    enqueue(&mut undelivered, event);
                                }
                                Ok(Inbound::Ping) => {
                                    send_frame(&stream, PusherFrame::pong()).await;
                                }
                                Ok(Inbound::Error { code, message }) => {
                                    warn!(code = ?code, message = %message, "Broker error");
                                }
                                Ok(other) => debug!(frame = ?other, "Control frame"),
                                Err(e) => warn!(error = %e, "Dropping malformed frame"),
                            }
                            None
                        }
                        Ok(Some(TransportFrame::Closed { code, reason })) => {
                            info!(code = ?code, reason = %reason, "Broker closed the connection");
                            Some(DisconnectReason::ClosedByServer { code, reason })
                        }
                        Ok(Some(TransportFrame::Error(e))) => {
                            warn!(error = %e, "Transport error");
                            Some(DisconnectReason::TransportError(e))
                        }
                        Ok(None) => Some(DisconnectReason::TransportError(
                            "transport ended".to_string(),
                        )),
                    };
                    if let Some(reason) = ended {
                        transport_done = true;
                        shared.alive.store(false, Ordering::SeqCst);
                        enqueue(&mut undelivered, ChannelEvent::Disconnected { reason });
                    }
                }
            }
            if let Some(new_sink) = replaced_sink {
                sink = new_sink;
            }
        }

        shared.alive.store(false, Ordering::SeqCst);
        info!(user = %shared.user_id, "Broker connection task terminated");
    })
}
