//! Pusher wire frames.
//!
//! Every frame is a JSON object `{ event, channel?, data? }`. The broker
//! double-encodes `data` as a JSON string for most events, while clients
//! may send it as a plain object; both forms are accepted here. Decoding
//! turns raw frames into [`Inbound`] values, with application events
//! validated into [`ChannelEvent`]s before they leave this module.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use gigline_shared::constants::*;
use gigline_shared::error::ProtocolError;
use gigline_shared::protocol::{ChannelEvent, MessageSentPayload, NotificationPush};

use crate::error::Result;

/// Raw frame as exchanged over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PusherFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PusherFrame {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn subscribe(channel: &str, auth: &str, channel_data: Option<&str>) -> Self {
        let mut data = json!({ "channel": channel, "auth": auth });
        if let Some(cd) = channel_data {
            data["channel_data"] = Value::String(cd.to_string());
        }
        Self {
            event: PUSHER_SUBSCRIBE.to_string(),
            channel: None,
            data: Some(data),
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            event: PUSHER_UNSUBSCRIBE.to_string(),
            channel: None,
            data: Some(json!({ "channel": channel })),
        }
    }

    pub fn ping() -> Self {
        Self {
            event: PUSHER_PING.to_string(),
            channel: None,
            data: Some(json!({})),
        }
    }

    pub fn pong() -> Self {
        Self {
            event: PUSHER_PONG.to_string(),
            channel: None,
            data: Some(json!({})),
        }
    }

    /// `data` with one level of string encoding removed.
    fn payload(&self) -> Result<Value> {
        match &self.data {
            None => Ok(Value::Null),
            Some(Value::String(s)) if s.is_empty() => Ok(Value::Null),
            Some(Value::String(s)) => Ok(serde_json::from_str(s)?),
            Some(other) => Ok(other.clone()),
        }
    }
}

/// Decoded meaning of an incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: Option<u64>,
    },
    SubscriptionSucceeded {
        channel: String,
    },
    SubscriptionError {
        channel: String,
        status: Option<u16>,
        message: String,
    },
    Error {
        code: Option<u16>,
        message: String,
    },
    Ping,
    Pong,
    Event(ChannelEvent),
    /// Well-formed but irrelevant (other channels' events, cache misses, ...).
    Ignored {
        event: String,
    },
}

#[derive(Deserialize)]
struct Established {
    socket_id: String,
    #[serde(default)]
    activity_timeout: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ErrorBody {
    fn text(self) -> String {
        self.message
            .or(self.error)
            .unwrap_or_else(|| "unspecified".to_string())
    }
}

/// Echo strips the namespace when listening (`.listen('MessageSent')`), and
/// some backends broadcast under a custom `broadcastAs` name, so match on
/// the trailing class name too.
fn event_is(event: &str, full: &str) -> bool {
    if event == full {
        return true;
    }
    let short = full.rsplit('\\').next().unwrap_or(full);
    event == short || event.trim_start_matches('.') == short
}

fn invalid(event: &str, reason: impl ToString) -> ProtocolError {
    ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: reason.to_string(),
    }
}

/// Decode one text frame.
///
/// Returns an error for malformed JSON and for application payloads that
/// fail validation; the caller logs and drops those.
pub fn decode(text: &str) -> Result<Inbound> {
    let frame = PusherFrame::parse(text)?;
    let event = frame.event.as_str();

    let inbound = match event {
        PUSHER_CONNECTION_ESTABLISHED => {
            let body: Established =
                serde_json::from_value(frame.payload()?).map_err(|e| invalid(event, e))?;
            Inbound::ConnectionEstablished {
                socket_id: body.socket_id,
                activity_timeout: body.activity_timeout,
            }
        }
        PUSHER_SUBSCRIPTION_SUCCEEDED => Inbound::SubscriptionSucceeded {
            channel: frame.channel.clone().unwrap_or_default(),
        },
        PUSHER_SUBSCRIPTION_ERROR => {
            let body: ErrorBody = serde_json::from_value(frame.payload()?).unwrap_or_default();
            Inbound::SubscriptionError {
                channel: frame.channel.clone().unwrap_or_default(),
                status: body.status.or(body.code),
                message: body.text(),
            }
        }
        PUSHER_ERROR => {
            let body: ErrorBody = serde_json::from_value(frame.payload()?).unwrap_or_default();
            Inbound::Error {
                code: body.code.or(body.status),
                message: body.text(),
            }
        }
        PUSHER_PING => Inbound::Ping,
        PUSHER_PONG => Inbound::Pong,
        e if event_is(e, EVENT_MESSAGE_SENT) => {
            let message = serde_json::from_value::<MessageSentPayload>(frame.payload()?)
                .map_err(|err| invalid(e, err))?
                .into_message();
            message.validate()?;
            Inbound::Event(ChannelEvent::MessageSent { message })
        }
        e if event_is(e, EVENT_NOTIFICATION_CREATED) => {
            let push = serde_json::from_value::<NotificationPush>(frame.payload()?)
                .map_err(|err| invalid(e, err))?;
            Inbound::Event(ChannelEvent::NotificationCreated {
                notification: push.into_notification(Utc::now()),
            })
        }
        other => Inbound::Ignored {
            event: other.to_string(),
        },
    };

    Ok(inbound)
}
