//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a local development backend works with
//! zero configuration. Credentials are not configuration: the bearer token
//! comes from the [`SessionContext`](crate::session::SessionContext).

use std::time::Duration;

use gigline_net::BrokerConfig;
use gigline_shared::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PONG_TIMEOUT_SECS, DEFAULT_PUSHER_CLUSTER,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Origin of the REST API.
    /// Env: `GIGLINE_API_BASE`
    /// Default: `http://localhost:8000`
    pub api_base: String,

    /// Public key of the broadcast application.
    /// Env: `PUSHER_APP_KEY`
    /// Default: empty (live updates unavailable).
    pub pusher_app_key: String,

    /// Env: `PUSHER_CLUSTER`
    /// Default: `ap1`
    pub pusher_cluster: String,

    /// Overrides the cluster-derived socket origin, e.g. for a self-hosted
    /// broker.
    /// Env: `PUSHER_WS_BASE`
    pub pusher_ws_base: Option<String>,

    /// Timeout applied to every REST call.
    /// Env: `GIGLINE_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// Budget for broker connect, handshake and each subscription.
    /// Env: `GIGLINE_CONNECT_TIMEOUT_SECS`
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            pusher_app_key: String::new(),
            pusher_cluster: DEFAULT_PUSHER_CLUSTER.to_string(),
            pusher_ws_base: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(base) = lookup("GIGLINE_API_BASE") {
            let base = base.trim().trim_end_matches('/');
            if base.starts_with("http://") || base.starts_with("https://") {
                config.api_base = base.to_string();
            } else {
                tracing::warn!(value = %base, "Invalid GIGLINE_API_BASE, using default");
            }
        }

        if let Some(key) = lookup("PUSHER_APP_KEY") {
            config.pusher_app_key = key.trim().to_string();
        }

        if let Some(cluster) = lookup("PUSHER_CLUSTER") {
            if !cluster.trim().is_empty() {
                config.pusher_cluster = cluster.trim().to_string();
            }
        }

        if let Some(base) = lookup("PUSHER_WS_BASE") {
            if base.starts_with("ws://") || base.starts_with("wss://") {
                config.pusher_ws_base = Some(base.trim_end_matches('/').to_string());
            } else {
                tracing::warn!(value = %base, "Invalid PUSHER_WS_BASE, using cluster default");
            }
        }

        if let Some(secs) = parse_secs(&lookup, "GIGLINE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "GIGLINE_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = secs;
        }

        config
    }

    /// Broker settings derived from this configuration.
    pub fn broker_config(&self) -> Result<BrokerConfig> {
        if self.pusher_app_key.is_empty() {
            return Err(ClientError::Config(
                "PUSHER_APP_KEY is not set; live updates are unavailable".into(),
            ));
        }
        let mut broker = BrokerConfig::for_cluster(self.pusher_app_key.clone(), &self.pusher_cluster);
        if let Some(base) = &self.pusher_ws_base {
            broker.ws_base = base.clone();
        }
        broker.connect_timeout = self.connect_timeout;
        broker.pong_timeout = Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS);
        Ok(broker)
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid timeout, using default");
            None
        }
        Ok(n) => Some(Duration::from_secs(n)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ClientConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = from_pairs(&[]);
        assert_eq!(config.api_base, "http://localhost:8000");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert!(config.broker_config().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("GIGLINE_API_BASE", "https://api.gigline.test/"),
            ("PUSHER_APP_KEY", "abc123"),
            ("PUSHER_CLUSTER", "eu"),
            ("GIGLINE_CONNECT_TIMEOUT_SECS", "3"),
        ]);
        assert_eq!(config.api_base, "https://api.gigline.test");

        let broker = config.broker_config().unwrap();
        assert_eq!(broker.ws_base, "wss://ws-eu.pusher.com");
        assert_eq!(broker.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("GIGLINE_API_BASE", "ftp://nope"),
            ("GIGLINE_REQUEST_TIMEOUT_SECS", "soon"),
            ("PUSHER_WS_BASE", "localhost:6001"),
        ]);
        assert_eq!(config.api_base, "http://localhost:8000");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.pusher_ws_base, None);
    }
}
