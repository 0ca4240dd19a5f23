//! Broker connection settings.

use std::time::Duration;

use gigline_shared::constants::{
    CLIENT_NAME, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PONG_TIMEOUT_SECS, DEFAULT_PUSHER_CLUSTER,
    PUSHER_PROTOCOL_VERSION,
};

/// Where and how to reach the Pusher-protocol broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Public application key.
    pub app_key: String,

    /// Websocket origin, e.g. `wss://ws-ap1.pusher.com`.
    pub ws_base: String,

    /// Budget for socket connect, handshake, and each channel subscription.
    pub connect_timeout: Duration,

    /// How long to wait for a pong after pinging an idle connection.
    pub pong_timeout: Duration,
}

impl BrokerConfig {
    /// Settings for a hosted Pusher cluster.
    pub fn for_cluster(app_key: impl Into<String>, cluster: &str) -> Self {
        Self {
            app_key: app_key.into(),
            ws_base: format!("wss://ws-{cluster}.pusher.com"),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
        }
    }

    /// Full socket URL including the protocol query string.
    pub fn socket_url(&self) -> String {
        format!(
            "{}/app/{}?protocol={}&client={}&version={}&flash=false",
            self.ws_base.trim_end_matches('/'),
            self.app_key,
            PUSHER_PROTOCOL_VERSION,
            CLIENT_NAME,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::for_cluster("", DEFAULT_PUSHER_CLUSTER)
    }
}
